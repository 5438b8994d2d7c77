use std::{fs, io};

use vhdio::{Image, format::DiskType};
use vhdio_test::build;

fn main() {
    env_logger::init();
    let args = std::env::args().collect::<Vec<String>>();
    match &*args {
        // Used by `../tests/large.rs` to compare against other tools.
        [_, cmd, kind, output] if cmd == "gen-fixture" => {
            let disk_type = match &**kind {
                "fixed" => DiskType::FIXED,
                "dynamic" => DiskType::DYNAMIC,
                "differencing" => DiskType::DIFFERENCING,
                _ => panic!("unknown image kind {kind:?}"),
            };
            let bytes = build::sample(disk_type).to_bytes();
            fs::write(output, bytes).expect("failed to write image");
        }
        [_, cmd, input, output] if cmd == "extract" => {
            let file = fs::File::open(input).expect("failed to open image");
            let mut image = Image::open(file).expect("failed to load image");
            let mut out = fs::File::create(output).expect("failed to create output");
            io::copy(&mut image.reader(), &mut out).expect("failed to extract image");
        }
        _ => panic!("invalid argument"),
    }
}
