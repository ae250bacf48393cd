use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy)]
pub enum ShutdownEvent {
    Graceful,
    Immediate,
}

/// First Ctrl-C requests a graceful drain; a second one forces an exit.
pub fn spawn_ctrl_c_handler(shutdown_tx: mpsc::UnboundedSender<ShutdownEvent>) {
    tokio::spawn(async move {
        let mut signals: u32 = 0;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            signals += 1;
            let event = if signals == 1 {
                ShutdownEvent::Graceful
            } else {
                ShutdownEvent::Immediate
            };
            if shutdown_tx.send(event).is_err() || signals > 1 {
                return;
            }
        }
    });
}
