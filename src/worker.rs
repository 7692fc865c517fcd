use crate::lifecycle::LifecycleEngine;
use crate::model::DesiredFdu;
use crate::status::DesiredAction;
use log::{error, info};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// One desired-state notification, forwarded from the fabric observer to
/// the single dispatcher task so two events for the same FDU never
/// interleave their lifecycle transitions.
pub enum WorkJob {
    Desired(DesiredFdu),
}

pub struct Worker {
    engine: Arc<LifecycleEngine>,
    tx: UnboundedSender<WorkJob>,
    rx: UnboundedReceiver<WorkJob>,
}

impl Worker {
    pub fn new(engine: Arc<LifecycleEngine>) -> Self {
        let (tx, rx) = unbounded_channel();
        Self { engine, tx, rx }
    }

    pub fn sender(&self) -> UnboundedSender<WorkJob> {
        self.tx.clone()
    }

    /// Pump desired-state notifications from the fabric subscription onto
    /// this worker's channel. Runs until the subscription is dropped.
    pub fn forward_from(
        tx: UnboundedSender<WorkJob>,
        mut sub: UnboundedReceiver<DesiredFdu>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(fdu) = sub.recv().await {
                if tx.send(WorkJob::Desired(fdu)).is_err() {
                    break;
                }
            }
        })
    }

    async fn dispatch(&self, fdu: DesiredFdu) {
        let uuid = fdu.uuid;
        let action = fdu.status.clone();
        let result = match action {
            DesiredAction::Define => self.engine.define_fdu(fdu).await,
            DesiredAction::Configure => self.engine.configure_fdu(uuid).await,
            DesiredAction::Run => self.engine.run_fdu(uuid).await,
            DesiredAction::Stop => self.engine.stop_fdu(uuid).await,
            DesiredAction::Pause => self.engine.pause_fdu(uuid).await,
            DesiredAction::Resume => self.engine.resume_fdu(uuid).await,
            DesiredAction::Clean => self.engine.clean_fdu(uuid).await,
            DesiredAction::Undefine => self.engine.undefine_fdu(uuid).await,
        };
        if let Err(e) = result {
            error!("action {action:?} on fdu {uuid} failed: {e}");
        }
    }

    pub async fn handle(&mut self) {
        info!("worker dispatch loop starting");
        while let Some(job) = self.rx.recv().await {
            match job {
                WorkJob::Desired(fdu) => self.dispatch(fdu).await,
            }
        }
        info!("worker dispatch loop exiting");
    }
}
