pub use std::sync::{Arc, Mutex};

pub use anyhow::{anyhow, bail, Context, Result};
pub use log::{debug, error, info, trace, warn};
pub use tokio::sync::{broadcast, mpsc, watch};

pub use crate::channels::{AggregatorLink, Channels};
pub use crate::config::{self, Config};
pub use crate::config_error;
pub use crate::error::{ConfigError, FatalError};
pub use crate::state::{BmsSnapshot, UnifiedState};
pub use crate::stats::{GatewayStats, SharedStats};
pub use crate::utils::Backoff;
