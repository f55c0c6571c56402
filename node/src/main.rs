mod replay;

use std::{env, fs, io, sync::atomic::Ordering};

use log::{info, warn};
use oversubscriber::{MosErr, SessionBuilder};
use specs::SessionSpec;
use tokio::{signal, task};

use crate::replay::ReplayStep;

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let path = env::args()
        .nth(1)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "usage: node <spec.json>"))?;

    let raw = fs::read_to_string(&path)?;
    let spec: SessionSpec = serde_json::from_str(&raw)?;
    info!(path:% = path; "loaded session spec");

    let dest = spec.mos.dest_sparse_model.clone();
    let mut step = ReplayStep::new(spec.solver.batch_size);
    let mut session = SessionBuilder::new().build(spec)?;
    let stop = session.stop_handle();

    let mut fit = task::spawn_blocking(move || {
        let report = session.fit(&mut step)?;
        Ok::<_, io::Error>((session, report))
    });

    let (session, report) = tokio::select! {
        ret = &mut fit => ret??,
        _ = signal::ctrl_c() => {
            warn!("received SIGINT, stopping before the next shard");
            stop.store(true, Ordering::Relaxed);
            fit.await??
        }
    };

    info!(
        epochs = report.epochs,
        iterations = report.iterations,
        snapshots = report.snapshots,
        stopped = report.stopped;
        "training done"
    );

    if let Some(dest) = dest {
        let exported = session.store().export(&dest).map_err(MosErr::from)?;
        info!(dest:? = dest, rows = exported.len(); "exported sparse model");
    }

    Ok(())
}
