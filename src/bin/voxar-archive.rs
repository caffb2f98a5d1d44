
//! Command line tool converting a raw voxel volume
//! into a block-indexed video archive.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process::exit;

use clap::{Parser, ValueEnum};

use voxar::error::{Error, Result};
use voxar::math::Vec3;
use voxar::meta::EncodeMethod;
use voxar::prelude::*;

#[derive(Debug, Parser)]
#[command(name = "voxar-archive")]
#[command(about = "Convert a raw voxel volume into a block-indexed video archive")]
struct Args {

    /// Raw input file, one byte per voxel, x varying fastest.
    #[arg(long, short)]
    input: PathBuf,

    /// Output archive file.
    #[arg(long, short)]
    output: PathBuf,

    /// Volume extent along x, in voxels.
    #[arg(long)]
    x: u32,

    /// Volume extent along y, in voxels.
    #[arg(long)]
    y: u32,

    /// Volume extent along z, in voxels.
    #[arg(long)]
    z: u32,

    /// Block side length as a binary logarithm, 5 to 14.
    #[arg(long, default_value_t = 6)]
    side: usize,

    /// Block overlap per face, in voxels, 0 to 2.
    #[arg(long, default_value_t = 2)]
    padding: usize,

    /// Soft memory limit of the conversion, in GiB.
    #[arg(long, default_value_t = 4)]
    memlimit: usize,

    /// Compute device for the codec.
    #[arg(long, value_enum, default_value = "default")]
    device: Device,

    /// Codec of the archive body.
    #[arg(long, value_enum, default_value = "raw")]
    codec: Codec,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Device { Default, Cuda, Cpu }

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Codec { H264, Hevc, Raw }

fn main() {
    let args = Args::parse();

    if let Err(error) = run(&args) {
        eprintln!("{}", error);
        exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    if let Device::Cuda = args.device {
        return Err(Error::unsupported("no cuda backend is built into this tool"));
    }

    let dimensions = Vec3(args.x as usize, args.y as usize, args.z as usize);
    let raw_source = RawVolume::open(&args.input, dimensions)?;

    let mut options = ArchiverOptions::new(args.side, args.padding);
    options.memory_limit = args.memlimit * 1024 * 1024 * 1024;
    options.encode.method = match args.codec {
        Codec::H264 => EncodeMethod::H264,
        Codec::Hevc => EncodeMethod::Hevc,
        Codec::Raw => EncodeMethod::Raw,
    };

    let sink = BufWriter::new(File::create(&args.output)?);
    let archiver = Archiver::new(raw_source, sink, options)?;

    let mut reported_percent = 0_u32;
    let summary = archiver.convert_with_progress(|progress| {
        let percent = (progress * 100.0) as u32;

        if percent >= reported_percent + 5 || percent == 100 && reported_percent < 100 {
            reported_percent = percent;
            eprintln!("{:>3} % of blocks written", percent);
        }
    })?;

    println!(
        "written {} blocks as {} frames ({} encoded bytes) to {}",
        summary.block_count, summary.frame_count,
        summary.body_byte_size, args.output.display()
    );

    Ok(())
}
