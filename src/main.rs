//! Container binary entry point.
//!
//! Launched as a subprocess by the cluster workload manager with three
//! environment inputs: `TASK_NAME` (container identifier), `CONFIG` (the
//! full config map as one JSON object), and `PARTITION_IDS` (the assigned
//! partitions). Exits 0 on graceful shutdown, 1 on any fatal error.
//!
//! This binary links only the built-in factories; deployments with their
//! own tasks, systems, or stores build a binary that registers those and
//! calls [`sluice_core::run_from_env`] the same way.

use sluice_core::FactoryRegistry;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let registry = FactoryRegistry::with_defaults();
    if let Err(error) = sluice_core::run_from_env(registry).await {
        // Logging comes up inside run_from_env once the config map parses;
        // stderr is the one channel that works on every failure path.
        eprintln!("container exited with fatal error: {error}");
        std::process::exit(1);
    }
}
