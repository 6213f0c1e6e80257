//! UDP channel implementation

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{Result, TransportError};
use crate::traits::{Channel, ChannelReceiver, TransportEvent};

/// UDP configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    /// Capacity of the inbound event queue
    pub recv_queue_size: usize,
    /// Maximum datagram size
    pub max_packet_size: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            recv_queue_size: 1024,
            max_packet_size: 65507, // Max UDP payload
        }
    }
}

/// UDP datagram channel
pub struct UdpChannel {
    socket: Arc<UdpSocket>,
    config: UdpConfig,
    open: Arc<AtomicBool>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpChannel {
    /// Bind to a local address
    pub async fn bind(addr: &str) -> Result<Self> {
        Self::bind_with_config(addr, UdpConfig::default()).await
    }

    /// Bind with config
    pub async fn bind_with_config(addr: &str, config: UdpConfig) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        if let Ok(local) = socket.local_addr() {
            info!("UDP bound to {}", local);
        }

        Ok(Self {
            socket: Arc::new(socket),
            config,
            open: Arc::new(AtomicBool::new(true)),
            receive_task: Mutex::new(None),
        })
    }

    /// Start receiving datagrams
    ///
    /// The receive task runs until [`Channel::close`]; starting again
    /// replaces it.
    pub fn start_receiver(&self) -> UdpReceiver {
        let (tx, rx) = mpsc::channel(self.config.recv_queue_size);
        let socket = self.socket.clone();
        let open = self.open.clone();
        let max_size = self.config.max_packet_size;

        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; max_size];

            while open.load(Ordering::Acquire) {
                match socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        debug!("UDP received {} bytes from {}", len, from);
                        let data = Bytes::copy_from_slice(&buf[..len]);
                        if tx.send((TransportEvent::Data(data), from)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("UDP receive error: {}", e);
                        if tx
                            .send((
                                TransportEvent::Error(e.to_string()),
                                SocketAddr::from(([0, 0, 0, 0], 0)),
                            ))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });
        if let Some(previous) = self.receive_task.lock().replace(task) {
            previous.abort();
        }

        UdpReceiver { rx }
    }
}

#[async_trait]
impl Channel for UdpChannel {
    async fn send_to(&self, data: Bytes, destination: SocketAddr) -> Result<()> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        self.socket
            .send_to(&data, destination)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(TransportError::Io)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::Release);
        if let Some(task) = self.receive_task.lock().take() {
            task.abort();
            debug!("UDP receive task stopped");
        }
        Ok(())
    }
}

/// UDP receiver
pub struct UdpReceiver {
    rx: mpsc::Receiver<(TransportEvent, SocketAddr)>,
}

#[async_trait]
impl ChannelReceiver for UdpReceiver {
    async fn recv_from(&mut self) -> Option<(TransportEvent, SocketAddr)> {
        self.rx.recv().await
    }
}
