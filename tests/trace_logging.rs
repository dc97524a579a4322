//! Asserts that lifecycle events surface as trace-level structured logs.

use std::io;
use std::sync::{Arc, Mutex};

use spillway::testing::{MemoryConnection, MemorySource};
use spillway::{Connection, OpenResourceTracker, ProxyFactory, Source};
use tracing_subscriber::fmt::MakeWriter;

/// A writer that appends everything into a shared buffer.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for SharedBuf {
    type Writer = SharedBuf;

    fn make_writer(&'a self) -> SharedBuf {
        self.clone()
    }
}

#[test]
fn lifecycle_events_emit_trace_logs() {
    let buf = SharedBuf::default();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_writer(buf.clone())
        .with_ansi(false)
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        let factory = ProxyFactory::new();
        let tracker = Arc::new(OpenResourceTracker::with_max_frames(0));
        factory.add_listener(tracker);

        let source = factory.wrap_source(MemorySource::new("primary"));
        let conn = source.connect().unwrap();
        conn.close().unwrap();
    });

    let output = buf.contents();
    assert!(output.contains("spillway::intercept"));
    assert!(output.contains("source wrapped"));
    assert!(output.contains("resource created"));
    assert!(output.contains("resource closed"));
    assert!(output.contains("kind=connection"));
    // The tracker logs its bookkeeping too.
    assert!(output.contains("spillway::tracker"));
    assert!(output.contains("resource now tracked as open"));
    assert!(output.contains("resource no longer tracked"));
}

#[test]
fn failed_closes_log_nothing() {
    let buf = SharedBuf::default();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_writer(buf.clone())
        .with_ansi(false)
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        let factory = ProxyFactory::new();
        let conn = factory.wrap_connection(MemoryConnection::with_failing_close());
        assert!(conn.close().is_err());
    });

    let output = buf.contents();
    assert!(output.contains("resource created"));
    assert!(!output.contains("resource closed"));
}
