//! Per-test log capture.
//!
//! Upload tests spawn lots of tasks across the worker threads of a multi-threaded runtime, and
//! interleaved output from tests running in parallel is useless.  [`test_with_logging`] gives each
//! test its own subscriber, installed on every runtime thread, and prints what it captured once the
//! test is over.
use crate::Result;
use once_cell::sync::Lazy;
use std::{
    cell::RefCell,
    future::Future,
    io::Write,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing_subscriber::fmt::MakeWriter;

/// Used when `RUST_LOG` isn't set.  The AWS SDK and its HTTP stack are very chatty at debug.
const DEFAULT_FILTER: &str = "ssstream=trace,h2=warn,hyper=info,rustls=info,aws=info,debug";

/// `color_eyre` may only be installed once per process
static EYRE_HOOK: Lazy<()> = Lazy::new(|| {
    // Another hook may have been installed by the test itself; that's fine
    let _ = color_eyre::install();
});

/// Collects formatted log events in memory
#[derive(Clone, Default)]
struct CapturedLogs {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLogs {
    /// Remove and return everything captured so far
    fn drain(&self) -> String {
        let bytes = std::mem::take(&mut *self.buffer.lock().unwrap());

        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl<'a> Write for &'a CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = &'a Self;

    fn make_writer(&'a self) -> Self::Writer {
        self
    }
}

fn make_dispatch(logs: CapturedLogs) -> tracing::Dispatch {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let format = fmt::layer()
        .with_level(true)
        .with_target(true)
        // Events come from several runtime threads at once
        .with_thread_ids(true)
        .with_thread_names(false)
        .with_writer(logs);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))
        .unwrap();

    tracing::Dispatch::new(tracing_subscriber::registry().with(filter).with(format))
}

/// Run an async test on its own multi-threaded tokio runtime, with logging captured for this test
/// only.
///
/// Use this instead of `#[tokio::test]`.  The test's subscriber is made the default on the calling
/// thread and on every thread the runtime starts, so events from spawned tasks are captured too.
/// The captured log is printed when the test finishes, whether it passed, failed, or panicked, so
/// it shows up in the output of failed tests.
pub fn test_with_logging(test: impl Future<Output = Result<()>>) -> Result<()> {
    Lazy::force(&EYRE_HOOK);

    let logs = CapturedLogs::default();
    let dispatch = Arc::new(make_dispatch(logs.clone()));

    std::thread_local! {
        static RUNTIME_THREAD_DISPATCH: RefCell<Option<tracing::subscriber::DefaultGuard>> = RefCell::new(None);
    }

    tracing::dispatcher::with_default(&dispatch, || {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all();

        let thread_dispatch = dispatch.clone();
        builder.on_thread_start(move || {
            let guard = tracing::dispatcher::set_default(&thread_dispatch);
            RUNTIME_THREAD_DISPATCH.with(|cell| cell.replace(Some(guard)));
        });
        builder.on_thread_stop(|| {
            RUNTIME_THREAD_DISPATCH.with(|cell| cell.replace(None));
        });

        let runtime = builder.build()?;

        // Test futures aren't required to be unwind safe; the runtime is discarded after a panic
        // anyway
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(move || {
            let result = runtime.block_on(test);
            runtime.shutdown_timeout(Duration::from_secs(10));

            result
        }));

        println!("Log events from this test: \n{}", logs.drain());

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    })
}
