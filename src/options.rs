use clap::Parser;

/// N-to-M gateway for Pylontech LV BMS over CAN
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Options {
    /// Copy the default configuration to the user config path and exit
    #[clap(long = "init")]
    pub init: bool,

    /// Verbose (debug) logging
    #[clap(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Config file to read instead of the default location
    #[clap(short = 'c', long = "config")]
    pub config_file: Option<String>,
}

impl Options {
    pub fn new() -> Self {
        Self::parse()
    }
}
