//! Reconnecting WebSocket event channel.
//!
//! One background task owns the socket. It reconnects after a fixed delay
//! whenever the connection drops, sends a heartbeat frame on a fixed
//! interval while connected, forwards inbound text frames to the serve
//! loop, and writes outbound messages queued through [`LiveChannel::push`].
//! Nothing is buffered across reconnects: pushes made while disconnected
//! fail immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cube_protocol::{Heartbeat, OutboundMessage};
use cube_runtime::{DispatchError, LiveChannel};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::ChannelConfig;

const OUTBOUND_BUFFER: usize = 256;
const INBOUND_BUFFER: usize = 256;

pub struct ChannelClient {
	config: ChannelConfig,
	connected: AtomicBool,
	connections: AtomicU64,
	writer: Mutex<Option<mpsc::Sender<String>>>,
	shutdown: watch::Sender<bool>,
}

/// Running channel: the client handle, inbound frames, and the socket task.
pub struct ChannelParts {
	pub client: Arc<ChannelClient>,
	pub inbound: mpsc::Receiver<String>,
	pub task: JoinHandle<()>,
}

impl ChannelClient {
	/// Starts the connection loop. Inbound text frames other than heartbeats
	/// arrive on `inbound`.
	pub fn spawn(config: ChannelConfig) -> ChannelParts {
		let (inbound_tx, inbound) = mpsc::channel(INBOUND_BUFFER);
		let (shutdown, _) = watch::channel(false);
		let client = Arc::new(Self {
			config,
			connected: AtomicBool::new(false),
			connections: AtomicU64::new(0),
			writer: Mutex::new(None),
			shutdown,
		});
		let task = {
			let client = Arc::clone(&client);
			tokio::spawn(async move { client.connection_loop(inbound_tx).await })
		};
		ChannelParts { client, inbound, task }
	}

	/// Number of successful connections so far, reconnects included.
	pub fn connections(&self) -> u64 {
		self.connections.load(Ordering::SeqCst)
	}

	/// Closes the socket and stops reconnecting.
	pub fn shutdown(&self) {
		self.shutdown.send_replace(true);
	}

	fn is_shutting_down(&self) -> bool {
		*self.shutdown.borrow()
	}

	async fn connection_loop(self: Arc<Self>, inbound: mpsc::Sender<String>) {
		let mut shutdown = self.shutdown.subscribe();
		loop {
			if self.is_shutting_down() || inbound.is_closed() {
				break;
			}

			match connect_async(self.config.url.as_str()).await {
				Ok((socket, _)) => {
					let count = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
					info!(target = "cube.channel", url = %self.config.url, connections = count, "channel connected");
					self.run_connection(socket, &inbound).await;
					info!(target = "cube.channel", url = %self.config.url, "channel disconnected");
				}
				Err(err) => {
					warn!(target = "cube.channel", url = %self.config.url, error = %err, "channel connect failed");
				}
			}

			if self.is_shutting_down() {
				break;
			}
			let delay = self.config.reconnect_delay();
			debug!(target = "cube.channel", delay_ms = delay.as_millis() as u64, "reconnecting after delay");
			tokio::select! {
				_ = tokio::time::sleep(delay) => {}
				_ = shutdown.changed() => {}
			}
		}
		debug!(target = "cube.channel", "connection loop stopped");
	}

	async fn run_connection<S>(&self, socket: tokio_tungstenite::WebSocketStream<S>, inbound: &mpsc::Sender<String>)
	where
		S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
	{
		let (mut sink, mut stream) = socket.split();
		let (writer, mut outgoing) = mpsc::channel::<String>(OUTBOUND_BUFFER);
		*self.writer.lock() = Some(writer);
		self.connected.store(true, Ordering::SeqCst);

		let heartbeat_every = self.config.heartbeat_interval();
		let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat_every, heartbeat_every);
		let mut shutdown = self.shutdown.subscribe();

		loop {
			tokio::select! {
				frame = stream.next() => match frame {
					Some(Ok(Message::Text(text))) => {
						if Heartbeat::matches(&text) {
							continue;
						}
						if inbound.send(text.to_string()).await.is_err() {
							debug!(target = "cube.channel", "inbound consumer gone");
							break;
						}
					}
					Some(Ok(Message::Ping(payload))) => {
						if sink.send(Message::Pong(payload)).await.is_err() {
							break;
						}
					}
					Some(Ok(Message::Close(_))) | None => break,
					Some(Ok(_)) => {}
					Some(Err(err)) => {
						warn!(target = "cube.channel", error = %err, "channel read failed");
						break;
					}
				},
				Some(json) = outgoing.recv() => {
					if let Err(err) = sink.send(Message::Text(json.into())).await {
						warn!(target = "cube.channel", error = %err, "channel write failed");
						break;
					}
				}
				_ = heartbeat.tick() => {
					let Ok(frame) = Heartbeat::default().to_json() else {
						continue;
					};
					if let Err(err) = sink.send(Message::Text(frame.into())).await {
						warn!(target = "cube.channel", error = %err, "heartbeat failed");
						break;
					}
					debug!(target = "cube.channel", "heartbeat sent");
				}
				_ = shutdown.changed() => {
					let _ = sink.send(Message::Close(None)).await;
					break;
				}
			}
		}

		self.connected.store(false, Ordering::SeqCst);
		self.writer.lock().take();
	}
}

#[async_trait]
impl LiveChannel for ChannelClient {
	fn is_connected(&self) -> bool {
		self.connected.load(Ordering::SeqCst)
	}

	async fn push(&self, message: OutboundMessage) -> Result<(), DispatchError> {
		let writer = self.writer.lock().clone();
		let Some(writer) = writer.filter(|_| self.is_connected()) else {
			return Err(DispatchError::Disconnected);
		};
		let json = message.to_json().map_err(|err| DispatchError::Channel(err.to_string()))?;
		writer.send(json).await.map_err(|_| DispatchError::Disconnected)
	}
}

/// Waits until `client` reports a live connection or `timeout` passes.
pub async fn wait_connected(client: &ChannelClient, timeout: Duration) -> bool {
	let deadline = tokio::time::Instant::now() + timeout;
	while tokio::time::Instant::now() < deadline {
		if client.is_connected() {
			return true;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	client.is_connected()
}
