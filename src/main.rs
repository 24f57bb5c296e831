use std::io::Write;

use log::error;

use bms_gateway::error::ConfigError;
use bms_gateway::options::Options;

#[tokio::main]
async fn main() {
    let options = Options::new();

    let default_level = if options.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .init();

    if let Err(err) = bms_gateway::app(options).await {
        error!("{err:#}");
        let code = if err.downcast_ref::<ConfigError>().is_some() {
            2
        } else {
            3
        };
        std::process::exit(code);
    }
}
