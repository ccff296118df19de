use clap::Parser;
use model::{
    catalog::Catalog,
    grading::{
        model::{gemini, relay, Fallback, Gemini, Relay},
        Grader,
    },
    init_logging, stats,
};
use std::path::PathBuf;

mod api;
mod test_runner;

/// Start the exam grading server.
#[derive(Clone, Debug, Parser)]
struct Options {
    /// The port where the app should be served.
    #[clap(short, long, env = "EXAM_GRADER_PORT", default_value = "8000")]
    port: u16,

    /// Directory containing the paper JSON files.
    #[clap(short, long, env = "EXAM_GRADER_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    #[clap(flatten)]
    stats: stats::Options,

    #[clap(flatten)]
    gemini: gemini::Options,

    #[clap(flatten)]
    relay: relay::Options,
}

impl Options {
    /// Load the catalog and connect to the language models and statistics store.
    fn state(&self) -> tide::Result<api::State> {
        let catalog = Catalog::load(&self.data_dir)?;
        tracing::info!(
            "loaded {} papers from {}",
            catalog.summaries().len(),
            self.data_dir.display()
        );

        let gemini = Gemini::new(&self.gemini);
        if !gemini.is_configured() {
            tracing::warn!("GEMINI_API_KEY is not set, grading will use the relay only");
        }
        let grader = Grader::new(Fallback::new(gemini, Relay::new(&self.relay)));
        Ok(api::State::new(catalog, grader, self.stats.open()))
    }

    async fn serve(&self) -> tide::Result<()> {
        api::serve(self.state()?, self.port).await
    }
}

#[async_std::main]
async fn main() -> tide::Result<()> {
    init_logging();
    Options::parse().serve().await
}
