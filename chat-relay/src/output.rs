use std::io::Write;

use tokio::sync::mpsc;

/// Somewhere to show chat lines: a console, a window, a test channel.
///
/// The core never branches on which one is active; it only appends lines.
pub trait OutputSink: Send + Sync {
    fn append_line(&self, line: &str);
}

/// Prints each line to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn append_line(&self, line: &str) {
        let mut stdout = std::io::stdout().lock();
        // Nothing useful to do if the terminal went away.
        let _ = writeln!(stdout, "{line}").and_then(|()| stdout.flush());
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn append_line(&self, _line: &str) {}
}

impl OutputSink for mpsc::UnboundedSender<String> {
    fn append_line(&self, line: &str) {
        let _ = self.send(line.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_sink_forwards_lines_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.append_line("one");
        tx.append_line("two");

        assert_eq!(rx.try_recv().ok().as_deref(), Some("one"));
        assert_eq!(rx.try_recv().ok().as_deref(), Some("two"));
    }
}
