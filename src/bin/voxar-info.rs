
//! Command line tool inspecting the meta data of a voxel archive.
//!
//! Exit codes: 0 on success, 1 when the file cannot be opened,
//! 2 when the archive meta data is inconsistent.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::exit;

use clap::Parser;

use voxar::math::Vec3;
use voxar::meta::ArchiveMeta;

#[derive(Debug, Parser)]
#[command(name = "voxar-info")]
#[command(about = "Inspect the meta data of a voxel archive")]
struct Args {

    /// The archive file to inspect.
    archive: PathBuf,

    /// Also print the frame window of every block.
    #[arg(long)]
    blocks: bool,
}

fn main() {
    let args = Args::parse();

    let file = match File::open(&args.archive) {
        Ok(file) => file,
        Err(error) => {
            eprintln!("cannot open {}: {}", args.archive.display(), error);
            exit(1);
        }
    };

    let meta = match ArchiveMeta::read_from_buffered(&mut BufReader::new(file)) {
        Ok(meta) => meta,
        Err(error) => {
            eprintln!("{}", error);
            exit(2);
        }
    };

    let header = &meta.header;
    let dimensions = |Vec3(x, y, z): Vec3<usize>| format!("{} x {} x {}", x, y, z);

    println!("{:>16}: {}", "size", dimensions(header.raw_dim));
    println!("{:>16}: {}", "padded size", dimensions(header.adjusted_dim));
    println!("{:>16}: {}", "grid size", dimensions(header.grid_dim));
    println!("{:>16}: {} = 2^{}", "block size", header.block_size, header.log_block_size);
    println!("{:>16}: {}", "padding", header.padding);
    println!("{:>16}: {:?}", "codec", header.encode_method);
    println!("{:>16}: {} bytes", "frame size", header.frame_size);
    println!("{:>16}: {}", "frames", meta.frame_count());
    println!("{:>16}: {} bytes", "encoded body", meta.body_byte_size());
    println!("{:>16}: {}", "blocks", meta.block_index.len());

    if args.blocks {
        for (index, block) in &meta.block_index {
            println!("{}: {}", index, block);
        }
    }
}
