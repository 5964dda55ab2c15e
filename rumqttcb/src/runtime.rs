//! Process wide runtime shared by all clients. [`init`] and [`cleanup`]
//! bracket the lifetime of every client in the process

use std::io;
use std::sync::Mutex;

use tokio::runtime::{self, Handle, Runtime};

use crate::lock;

/// Runtime and the number of `init` calls not yet matched by `cleanup`
static RUNTIME: Mutex<Option<(Runtime, usize)>> = Mutex::new(None);

/// Initialises the library. Must be called before any client is created.
/// Calls nest, each one needs a matching [`cleanup`]
pub fn init() -> io::Result<()> {
    let mut runtime = lock(&RUNTIME);
    match runtime.as_mut() {
        Some((_, count)) => *count += 1,
        None => {
            let rt = runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name("rumqttcb-runtime")
                .enable_all()
                .build()?;

            debug!("Runtime started");
            *runtime = Some((rt, 1));
        }
    }

    Ok(())
}

/// Releases the library. The runtime stops once every [`init`] is matched,
/// clients must be dropped before that
pub fn cleanup() {
    let mut runtime = lock(&RUNTIME);
    let stop = match runtime.as_mut() {
        Some((_, count)) => {
            *count -= 1;
            *count == 0
        }
        None => false,
    };

    if stop {
        if let Some((rt, _)) = runtime.take() {
            rt.shutdown_background();
            debug!("Runtime stopped");
        }
    }
}

/// Handle of the runtime, `None` before `init`
pub(crate) fn handle() -> Option<Handle> {
    lock(&RUNTIME).as_ref().map(|(rt, _)| rt.handle().clone())
}

/// Version of the library as (major, minor, revision)
pub fn version() -> (u32, u32, u32) {
    let major = env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0);
    let minor = env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0);
    let revision = env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0);
    (major, minor, revision)
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn version_matches_manifest() {
        let (major, minor, revision) = version();
        let version = format!("{}.{}.{}", major, minor, revision);
        assert_eq!(version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn init_is_reference_counted() {
        init().unwrap();
        init().unwrap();
        assert!(handle().is_some());

        cleanup();
        assert!(handle().is_some());

        // other tests in this binary may hold their own reference
        init().unwrap();
        cleanup();
        cleanup();
    }
}
