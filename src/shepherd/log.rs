use chrono::Local;

/// Timestamped event sink shared by the reactor and every capture reader.
///
/// Lines go to stderr so they land in the journal when shepherd runs under an
/// init system, and in the terminal when it runs in the foreground. The sink
/// is a value handed to whoever needs it, not process-global state.
#[derive(Debug, Clone, Copy)]
pub struct Logger {
    sink: Sink,
}

#[derive(Debug, Clone, Copy)]
enum Sink {
    Stderr,
    Quiet,
}

impl Logger {
    pub fn stderr() -> Self {
        Logger { sink: Sink::Stderr }
    }

    /// Discards everything. Used by tests that drive a whole reactor.
    pub fn quiet() -> Self {
        Logger { sink: Sink::Quiet }
    }

    pub fn event(&self, component: &str, daemon: Option<&str>, msg: impl AsRef<str>) {
        if let Sink::Quiet = self.sink {
            return;
        }
        let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
        match daemon {
            Some(d) => eprintln!("{ts} [{component}] daemon={d} {}", msg.as_ref()),
            None => eprintln!("{ts} [{component}] {}", msg.as_ref()),
        }
    }
}
