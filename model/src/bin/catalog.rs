use clap::Parser;
use model::{
    catalog::{repair::repair_dir, Catalog},
    init_logging, stats,
};
use std::io::{stdout, Write};
use std::path::PathBuf;

/// Maintain the exam paper catalog.
#[derive(Parser)]
enum Command {
    /// Print the paper index, as served by the list endpoint.
    Index {
        /// Directory containing the paper JSON files.
        #[clap(short, long, env = "EXAM_GRADER_DATA_DIR", default_value = "data", name = "DIR")]
        dir: PathBuf,
    },
    /// Fill in question scores, essay markers and word limits that the paper scraper missed.
    ///
    /// Repaired papers are rewritten in place.
    Repair {
        /// Directory containing the paper JSON files.
        #[clap(short, long, env = "EXAM_GRADER_DATA_DIR", default_value = "data", name = "DIR")]
        dir: PathBuf,

        /// Only repair papers whose file name starts with PREFIX. May be given more than once.
        #[clap(short, long, name = "PREFIX")]
        prefix: Vec<String>,
    },
    /// Print submission statistics.
    Stats {
        #[clap(flatten)]
        stats: stats::Options,
    },
}

fn main() -> Result<(), anyhow::Error> {
    init_logging();

    match Command::parse() {
        Command::Index { dir } => {
            let catalog = Catalog::load(dir)?;
            tracing::info!("{} papers, ETag {}", catalog.summaries().len(), catalog.etag());
            let mut out = stdout().lock();
            out.write_all(catalog.index_json())?;
            writeln!(out)?;
        }
        Command::Repair { dir, prefix } => {
            let repaired = repair_dir(&dir, &prefix)?;
            tracing::info!("repaired {} papers in {}", repaired.len(), dir.display());
            for name in repaired {
                println!("{name}");
            }
        }
        Command::Stats { stats } => {
            let summary = stats.open().summary();
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli() {
        Command::command().debug_assert();

        // Without prefixes, every paper is repaired.
        match Command::parse_from(["catalog", "repair"]) {
            Command::Repair { prefix, .. } => assert!(prefix.is_empty()),
            _ => panic!("expected repair command"),
        }
    }
}
