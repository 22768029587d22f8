//! Run-outcome messages to the system log, facility CRON.
//!
//! Opened only when `-l` or `-d` is given; a syslog that cannot be reached
//! downgrades to a tracing warning rather than failing the run.

use syslog::{Facility, Formatter3164, Logger, LoggerBackend};
use tracing::warn;

pub struct Journal {
    logger: Option<Logger<LoggerBackend, Formatter3164>>,
    debug: bool,
}

impl Journal {
    pub fn open(enabled: bool, debug: bool) -> Journal {
        let logger = if enabled || debug {
            let formatter = Formatter3164 {
                facility: Facility::LOG_CRON,
                hostname: None,
                process: "warden".into(),
                pid: std::process::id(),
            };
            match syslog::unix(formatter) {
                Ok(l) => Some(l),
                Err(e) => {
                    warn!("cannot open syslog: {e}");
                    None
                }
            }
        } else {
            None
        };
        Journal { logger, debug }
    }

    /// Log a run outcome at info priority.
    pub fn outcome(&mut self, msg: &str) {
        if let Some(l) = &mut self.logger {
            let _ = l.info(msg);
        }
    }

    /// Log detail at debug priority; dropped unless `-d` was given.
    pub fn detail(&mut self, msg: &str) {
        if self.debug {
            if let Some(l) = &mut self.logger {
                let _ = l.debug(msg);
            }
        }
    }
}
