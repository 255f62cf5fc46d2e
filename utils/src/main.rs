mod check_config;
mod export;
mod inspect;

use structopt::StructOpt;

#[derive(StructOpt)]
pub enum Options {
    CheckConfig(check_config::CheckConfigOptions),
    Inspect(inspect::InspectOptions),
    Export(export::ExportOptions),
}

fn main() -> anyhow::Result<()> {
    chessformer::logger::init_tracing();

    match Options::from_args() {
        Options::CheckConfig(options) => options.run(),
        Options::Inspect(options) => options.run(),
        Options::Export(options) => options.run(),
    }
}
