//! apfsck — APFS B-tree consistency checker
//!
//! # Usage
//!
//! ```text
//! apfsck <image>        Walk every reachable B-tree and report pass/fail
//! ```

mod style;

use std::env;
use std::fs::File;
use std::io::BufReader;
use std::process;
use std::time::Instant;

use style::*;

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() != 2 || matches!(args[1].as_str(), "-h" | "--help" | "help") {
        print_usage();
        process::exit(if args.len() != 2 { 1 } else { 0 });
    }

    if let Err(e) = run(&args[1]) {
        eprintln!("{RED}error:{RESET} {e}");
        process::exit(1);
    }
}

fn run(image_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let t_total = Instant::now();

    let file = File::open(image_path)?;
    let reader = BufReader::new(file);

    header(&format!("APFS consistency check: {image_path}"));

    spinner_msg("walking container and volume trees");
    let result = apfs::check_container(reader);
    let elapsed = t_total.elapsed();

    let report = match result {
        Ok(report) => {
            spinner_done("");
            report
        }
        Err(e) => {
            spinner_failed("");
            return Err(Box::new(e));
        }
    };

    section("Volume");
    kv("Name", &report.volume_name);
    kv("Block size", &format!("{} bytes", report.block_size));

    section("Trees");
    report_tree("Container object map", &report.container_omap);
    report_tree("Volume object map", &report.volume_omap);
    report_tree("Catalog", &report.catalog);
    report_tree("Extent reference", &report.extentref);
    report_tree("Snapshot metadata", &report.snap_meta);

    section("Result");
    kv_highlight("Status", "consistent");
    kv("Elapsed", &format_duration(elapsed));
    println!();

    Ok(())
}

fn report_tree(label: &str, stats: &apfs::TreeStats) {
    kv(
        label,
        &format!(
            "{} keys, {} nodes",
            format_commas(stats.key_count),
            format_commas(stats.node_count)
        ),
    );
}

fn print_usage() {
    eprintln!(
        r#"
{BOLD}apfsck{RESET} — APFS B-tree consistency checker

{DIM}Walks the container object map, the first volume's object map, and its
catalog, extent-reference and snapshot-metadata trees, proving every
Invariant of the B-tree on-disk format holds.{RESET}

{BOLD}USAGE:{RESET}
    apfsck <image>

{BOLD}EXAMPLES:{RESET}
    apfsck container.img
"#
    );
}
