use std::error::Error;

use tracing::{error, warn};

/// Operator notification channel used when a producer cannot be started.
pub trait AlarmSink: Send + Sync {
    fn alarm(&self, message: &str, cause: &(dyn Error + 'static), critical: bool);
}

/// Default sink: alarms end up in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlarmSink;

impl AlarmSink for LogAlarmSink {
    fn alarm(&self, message: &str, cause: &(dyn Error + 'static), critical: bool) {
        if critical {
            error!(target: "producer::alarm", cause = %cause, "{message}");
        } else {
            warn!(target: "producer::alarm", cause = %cause, "{message}");
        }
    }
}
