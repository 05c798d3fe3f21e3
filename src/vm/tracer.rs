//! Buffered execution tracer for the interpreter.
//!
//! ## Environment Variables
//!
//! - `DOTNET_SYNTH_TRACE`: destination of the trace
//!   - `"1"`, `"true"` or `"stdout"`: standard output
//!   - `"stderr"`: standard error
//!   - anything else: a file created at that path
//!
//! - `DOTNET_SYNTH_TRACE_FLUSH_INTERVAL`: lines buffered between flushes (default: 10000)
//!
//! - `DOTNET_SYNTH_TRACE_STATS`: count events per kind (`"1"` or `"true"`)
//!
//! The tracer is process-wide and shared by every [`Executor`](super::Executor); when
//! disabled, each trace call is a single branch.
use parking_lot::Mutex;
use std::{
    env, fmt,
    fs::File,
    io::{BufWriter, Write, stderr, stdout},
    sync::{
        LazyLock,
        atomic::{AtomicUsize, Ordering},
    },
};

const BUFFER_SIZE: usize = 256 * 1024;
const DEFAULT_FLUSH_INTERVAL: usize = 10_000;

static TRACER: LazyLock<Tracer> = LazyLock::new(Tracer::from_env);

pub fn tracer() -> &'static Tracer {
    &TRACER
}

#[derive(Clone, Copy)]
enum Event {
    Instruction,
    Call,
    Return,
    Exception,
    Branch,
    Field,
}

const EVENT_KINDS: usize = 6;

/// Snapshot of the tracer's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceStats {
    pub total_messages: usize,
    pub instructions_traced: usize,
    pub method_calls: usize,
    pub method_returns: usize,
    pub exceptions: usize,
    pub branches: usize,
    pub field_accesses: usize,
}

impl fmt::Display for TraceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows = [
            ("lines", self.total_messages),
            ("instructions", self.instructions_traced),
            ("calls", self.method_calls),
            ("returns", self.method_returns),
            ("exceptions", self.exceptions),
            ("branches", self.branches),
            ("field accesses", self.field_accesses),
        ];
        writeln!(f, "trace statistics:")?;
        for (label, count) in rows {
            writeln!(f, "  {:<16}{:>10}", label, count)?;
        }
        Ok(())
    }
}

type Sink = BufWriter<Box<dyn Write + Send>>;

pub struct Tracer {
    sink: Option<Mutex<Sink>>,
    pending: AtomicUsize,
    flush_interval: usize,
    counts: Option<[AtomicUsize; EVENT_KINDS]>,
}

impl Tracer {
    pub fn from_env() -> Self {
        let destination: Option<Box<dyn Write + Send>> = match env::var("DOTNET_SYNTH_TRACE") {
            Ok(v) if matches!(v.as_str(), "1" | "true" | "stdout") => Some(Box::new(stdout())),
            Ok(v) if v == "stderr" => Some(Box::new(stderr())),
            Ok(v) if !v.is_empty() => match File::create(&v) {
                Ok(file) => Some(Box::new(file)),
                Err(e) => {
                    tracing::warn!(path = %v, error = %e, "trace file could not be created");
                    None
                }
            },
            _ => None,
        };
        let flush_interval = env::var("DOTNET_SYNTH_TRACE_FLUSH_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_FLUSH_INTERVAL);
        let stats = env::var("DOTNET_SYNTH_TRACE_STATS").is_ok_and(|v| v == "1" || v == "true");
        Self::new(destination, flush_interval, stats)
    }

    /// A tracer writing to an arbitrary sink.
    pub fn to_writer(writer: Box<dyn Write + Send>, stats: bool) -> Self {
        Self::new(Some(writer), DEFAULT_FLUSH_INTERVAL, stats)
    }

    pub fn disabled() -> Self {
        Self::new(None, DEFAULT_FLUSH_INTERVAL, false)
    }

    fn new(destination: Option<Box<dyn Write + Send>>, flush_interval: usize, stats: bool) -> Self {
        Self {
            sink: destination.map(|w| Mutex::new(BufWriter::with_capacity(BUFFER_SIZE, w))),
            pending: AtomicUsize::new(0),
            flush_interval: flush_interval.max(1),
            counts: stats.then(|| std::array::from_fn(|_| AtomicUsize::new(0))),
        }
    }

    #[inline(always)]
    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    fn emit(&self, event: Event, depth: usize, line: fmt::Arguments) {
        let Some(sink) = &self.sink else {
            return;
        };
        if let Some(counts) = &self.counts {
            counts[event as usize].fetch_add(1, Ordering::Relaxed);
        }
        let mut out = sink.lock();
        let _ = write!(out, "{:width$}", "", width = depth * 2);
        let _ = out.write_fmt(line);
        let _ = out.write_all(b"\n");
        if self.pending.fetch_add(1, Ordering::Relaxed) + 1 >= self.flush_interval {
            let _ = out.flush();
            self.pending.store(0, Ordering::Relaxed);
        }
    }

    pub fn flush(&self) {
        if let Some(sink) = &self.sink {
            let _ = sink.lock().flush();
            self.pending.store(0, Ordering::Relaxed);
        }
    }

    pub fn trace_instruction(&self, depth: usize, ip: usize, instruction: &dyn fmt::Debug) {
        self.emit(Event::Instruction, depth, format_args!("{:04} {:?}", ip, instruction));
    }

    pub fn trace_method_entry(&self, depth: usize, name: &str, signature: &str) {
        if signature.is_empty() {
            self.emit(Event::Call, depth, format_args!("enter {}", name));
        } else {
            self.emit(Event::Call, depth, format_args!("enter {} ({})", name, signature));
        }
    }

    pub fn trace_method_exit(&self, depth: usize, name: &str) {
        self.emit(Event::Return, depth, format_args!("leave {}", name));
    }

    pub fn trace_exception(&self, depth: usize, exception: &str, location: &str) {
        self.emit(Event::Exception, depth, format_args!("throw {} in {}", exception, location));
    }

    pub fn trace_field_access(&self, depth: usize, op: &str, field: &str, value: &str) {
        self.emit(Event::Field, depth, format_args!("{} .{} = {}", op, field, value));
    }

    pub fn trace_branch(&self, depth: usize, opcode: &str, target: usize, taken: bool) {
        let arrow = if taken { "->" } else { "-/>" };
        self.emit(Event::Branch, depth, format_args!("{} {} {:04}", opcode, arrow, target));
    }

    pub fn stats(&self) -> TraceStats {
        let Some(counts) = &self.counts else {
            return TraceStats::default();
        };
        let get = |event: Event| counts[event as usize].load(Ordering::Relaxed);
        TraceStats {
            total_messages: counts.iter().map(|c| c.load(Ordering::Relaxed)).sum(),
            instructions_traced: get(Event::Instruction),
            method_calls: get(Event::Call),
            method_returns: get(Event::Return),
            exceptions: get(Event::Exception),
            branches: get(Event::Branch),
            field_accesses: get(Event::Field),
        }
    }

    /// Writes the counters to stderr when statistics are enabled.
    pub fn print_stats(&self) {
        if self.is_enabled() && self.counts.is_some() {
            eprint!("{}", self.stats());
        }
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        self.print_stats();
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_disabled_tracer_writes_nothing() {
        let t = Tracer::disabled();
        assert!(!t.is_enabled());
        t.trace_method_entry(0, "A::B", "");
        assert_eq!(t.stats(), TraceStats::default());
    }

    #[test]
    fn test_trace_lines_and_stats() {
        let buffer = Buffer::default();
        let t = Tracer::to_writer(Box::new(buffer.clone()), true);
        t.trace_method_entry(0, "Demo::Run", "int32");
        t.trace_branch(1, "bne.un.s", 3, true);
        t.trace_branch(1, "brfalse.s", 12, false);
        t.trace_method_exit(0, "Demo::Run");
        t.flush();

        let text = String::from_utf8(buffer.0.lock().clone()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines,
            [
                "enter Demo::Run (int32)",
                "  bne.un.s -> 0003",
                "  brfalse.s -/> 0012",
                "leave Demo::Run",
            ]
        );
        let stats = t.stats();
        assert_eq!(stats.method_calls, 1);
        assert_eq!(stats.method_returns, 1);
        assert_eq!(stats.branches, 2);
        assert_eq!(stats.total_messages, 4);
        assert!(stats.to_string().contains("branches"));
    }
}
