mod disk;
mod ext2;
mod fsck;
mod mbr;
#[cfg(test)]
mod test_helpers;
mod util;

use std::mem::size_of;

use anyhow::{Context, Result};
use clap::{App, Arg, ArgMatches};
use log::{info, warn};
use static_assertions::const_assert;

use crate::disk::DiskImage;
use crate::fsck::Fsck;
use crate::mbr::{PartitionEntry, PartitionTable};

const_assert!(size_of::<usize>() >= size_of::<u32>());

fn main() {
    env_logger::init();

    let matches = parse_args();
    if let Err(reason) = run(&matches) {
        eprintln!("Error: {:#}", reason);
        std::process::exit(1);
    }
}

fn parse_args() -> ArgMatches<'static> {
    build_app().get_matches()
}

fn build_app() -> App<'static, 'static> {
    App::new("ext2fsck-rs")
        .about("Checks and repairs ext2 partitions behind an MBR partition table")
        .arg(
            Arg::with_name("input")
                .short("i")
                .long("input")
                .value_name("PATH")
                .help("Disk image or block device to operate on")
                .required(true)
                .takes_value(true),
        )
        .arg(
            Arg::with_name("print")
                .short("p")
                .long("print")
                .value_name("NUMBER")
                .help("Print the table entry of the partition with this 1-based number")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("fix")
                .short("f")
                .long("fix")
                .value_name("NUMBER")
                .help("Check and repair this partition (0 checks every ext2 partition)")
                .takes_value(true),
        )
}

fn run(matches: &ArgMatches) -> Result<()> {
    let image_path = matches.value_of("input").unwrap();
    let mut disk = DiskImage::open(image_path)?;
    let table = PartitionTable::read(&disk)?;

    if let Some(raw) = matches.value_of("print") {
        let number = parse_partition_number(raw, "-p")?;
        // a number naming no partition prints a sentinel instead of failing the run
        println!("{}", table.listing_line(number));
    }

    if let Some(raw) = matches.value_of("fix") {
        let number = parse_partition_number(raw, "-f")?;
        fix_partitions(&mut disk, &table, number)?;
    }
    Ok(())
}

fn parse_partition_number(raw: &str, flag: &str) -> Result<usize> {
    raw.parse().with_context(|| format!("The partition number for {} must be a non-negative integer", flag))
}

/// Partition number 0 is shorthand for every partition whose type code marks it as ext2; any
/// other number is checked no matter its type code, the superblock has the final say.
fn fix_partitions(disk: &mut DiskImage, table: &PartitionTable, number: usize) -> Result<()> {
    if number == 0 {
        let numbers: Vec<usize> = table
            .entries()
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_ext2())
            .map(|(index, _)| index + 1)
            .collect();
        if numbers.is_empty() {
            warn!("the partition table holds no ext2 partitions");
        }
        for number in numbers {
            let entry = *table.get(number).unwrap();
            check_partition(disk, &entry, number)?;
        }
    } else {
        match table.get(number) {
            Some(&entry) => check_partition(disk, &entry, number)?,
            None => println!("-1"),
        }
    }
    Ok(())
}

fn check_partition(disk: &mut DiskImage, entry: &PartitionEntry, number: usize) -> Result<()> {
    info!("checking partition {} ({})", number, entry);
    match Fsck::new(disk, entry)?.run()? {
        Some(report) => println!("partition {}: {}", number, report),
        None => println!("partition {}: root directory unusable, not checked", number),
    }
    Ok(())
}
