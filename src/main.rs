//! pipehub - hub process entry point
//!
//! Usage: `pipehub [CONFIG]`. Without an argument the platform default
//! config file is used if it exists.
//!
//! Every peer connection gets a reader task that forwards decoded messages
//! to one central loop. The loop owns the [`HubDispatcher`] and hands its
//! deliveries to the per-connection send queues.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use pipehub::config::{default_config_path, HubConfig, HubRole, LoggingSection};
use pipehub::hub::{Dispatch, HubDispatcher, PeerId};
use pipehub::transport::tcp::{ConnectionTasks, TcpConnection};
use pipehub::{Message, StateTracker};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

type Inbox = mpsc::UnboundedSender<(PeerId, pipehub::Result<Message>)>;

fn init_logging(logging: &LoggingSection) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match &logging.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, &logging.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

fn load_config() -> anyhow::Result<HubConfig> {
    match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => HubConfig::load(&path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(default_config_path()
            .map(HubConfig::load_or_default)
            .unwrap_or_default()),
    }
}

/// Connections of the running hub.
struct Hub {
    dispatcher: HubDispatcher,
    connections: HashMap<PeerId, TcpConnection>,
    tasks: HashMap<PeerId, ConnectionTasks>,
    inbox: Inbox,
}

impl Hub {
    fn attach(&mut self, conn: TcpConnection, tasks: ConnectionTasks) -> PeerId {
        let (peer, dispatch) = self.dispatcher.connect_peer();
        self.connections.insert(peer, conn.clone());
        self.tasks.insert(peer, tasks);

        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            loop {
                let result = conn.recv().await;
                let done = result.is_err();
                if inbox.send((peer, result)).is_err() || done {
                    break;
                }
            }
        });

        self.deliver(dispatch);
        peer
    }

    fn remove(&mut self, peer: PeerId) {
        self.connections.remove(&peer);
        if let Some(tasks) = self.tasks.remove(&peer) {
            tasks.reader.abort();
            tasks.writer.abort();
        }
    }

    fn deliver(&mut self, dispatch: Dispatch) {
        for (peer, msg) in dispatch.outgoing {
            match self.connections.get(&peer) {
                Some(conn) => conn.async_send(
                    msg,
                    Some(Box::new(move |res| {
                        if let Err(e) = res {
                            tracing::warn!("send to {} failed: {}", peer, e);
                        }
                    })),
                ),
                None => tracing::debug!("dropping {} for vanished {}", msg.message_type(), peer),
            }
        }
        for peer in dispatch.close {
            let detached = self.dispatcher.detach(peer);
            self.remove(peer);
            self.deliver(detached);
        }
    }

    fn handle(&mut self, peer: PeerId, result: pipehub::Result<Message>) {
        match result {
            Ok(msg) => {
                tracing::trace!("{} from {}", msg.message_type(), peer);
                let dispatch = self.dispatcher.dispatch(peer, msg);
                self.deliver(dispatch);
            }
            Err(e) => {
                tracing::info!("{} disconnected: {}", peer, e);
                let dispatch = self.dispatcher.detach(peer);
                self.remove(peer);
                self.deliver(dispatch);
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    let _guard = init_logging(&config.logging);
    config.validate()?;

    tracing::info!("Starting pipehub {:?} hub '{}'", config.hub.role, config.hub.name);

    let tracker = Arc::new(StateTracker::new(
        config.hub.name.clone(),
        config.hub.initial_id(),
    ));
    let (inbox, mut rx) = mpsc::unbounded_channel();
    let mut hub = Hub {
        dispatcher: HubDispatcher::new(&config.hub, tracker),
        connections: HashMap::new(),
        tasks: HashMap::new(),
        inbox,
    };

    let listener = TcpListener::bind(config.hub.bind_address())
        .await
        .with_context(|| format!("binding {}", config.hub.bind_address()))?;
    tracing::info!("listening on {}", config.hub.bind_address());

    if config.hub.role == HubRole::Slave {
        let master = config
            .hub
            .master_address
            .as_deref()
            .context("slave hub needs hub.master_address")?;
        let (conn, tasks) = TcpConnection::connect(master, config.transport.max_payload)
            .await
            .with_context(|| format!("connecting to master {}", master))?;
        hub.attach(conn, tasks);
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let (conn, tasks) = TcpConnection::new(stream, config.transport.max_payload);
                    let peer = hub.attach(conn, tasks);
                    tracing::info!("accepted {} as {}", addr, peer);
                }
                Err(e) => tracing::warn!("accept failed: {}", e),
            },
            Some((peer, result)) = rx.recv() => {
                hub.handle(peer, result);
                if hub.dispatcher.quit_requested() {
                    tracing::info!("quitting");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        }
    }

    // let queued Quit broadcasts drain before the runtime goes away
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    Ok(())
}
