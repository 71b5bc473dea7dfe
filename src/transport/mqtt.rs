//! MQTT Transport
//!
//! Connects to an MQTT v3.1.1 broker over TCP. Relay topics are used as
//! MQTT topic names verbatim and everything travels at QoS 0.
//!
//! Each connection runs one task that owns the socket. Callers talk to it
//! through a command channel; acknowledgements for SUBSCRIBE/UNSUBSCRIBE
//! come back on per-request oneshots.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::codec::{self, connack_reason, Packet, SUBACK_FAILURE};
use super::{Connection, Connector, EventSender, LinkState, TransportError, TransportEvent};

type Reply = oneshot::Sender<Result<(), TransportError>>;

/// Command sent to the connection task
#[derive(Debug)]
enum LinkCommand {
    Subscribe { channel: String, reply: Reply },
    Unsubscribe { channel: String, reply: Reply },
    Publish {
        channel: String,
        payload: Bytes,
        reply: Reply,
    },
    Shutdown,
}

/// MQTT connection settings
#[derive(Debug, Clone)]
pub struct MqttOptions {
    /// Broker address as `host:port`
    pub address: String,
    /// Keep alive in seconds
    pub keepalive: u16,
    /// TCP connect and CONNACK timeout
    pub connect_timeout: Duration,
    /// How long to wait for SUBACK/UNSUBACK
    pub ack_timeout: Duration,
}

impl Default for MqttOptions {
    fn default() -> Self {
        Self {
            address: "localhost:1883".to_string(),
            keepalive: 60,
            connect_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
        }
    }
}

/// Opens MQTT links
#[derive(Debug, Clone)]
pub struct MqttConnector {
    options: MqttOptions,
}

impl MqttConnector {
    pub fn new(options: MqttOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &MqttOptions {
        &self.options
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(
        &self,
        client_id: &str,
        epoch: u64,
        events: EventSender,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let options = &self.options;
        debug!("MQTT: connecting to {} as '{}'", options.address, client_id);

        let stream = timeout(options.connect_timeout, TcpStream::connect(&options.address))
            .await
            .map_err(|_| TransportError::Timeout)??;
        stream.set_nodelay(true)?;

        let (mut read_half, mut write_half) = stream.into_split();
        let mut buf = BytesMut::new();

        let connect = Packet::Connect {
            client_id: client_id.to_string(),
            keep_alive: options.keepalive,
        };
        write_packet(&mut write_half, &mut buf, &connect).await?;

        // Wait for CONNACK; anything after it stays buffered for the link task
        let mut read_buf = BytesMut::with_capacity(4096);
        let packet = timeout(
            options.connect_timeout,
            read_packet(&mut read_half, &mut read_buf),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        match packet {
            Packet::ConnAck {
                return_code: 0,
                session_present,
            } => {
                info!(
                    "MQTT: connected to {} (session_present={})",
                    options.address, session_present
                );
            }
            Packet::ConnAck { return_code, .. } => {
                return Err(TransportError::Rejected {
                    code: Some(u32::from(return_code)),
                    message: format!("CONNACK refused: {}", connack_reason(return_code)),
                });
            }
            _ => return Err(TransportError::Other("Expected CONNACK".to_string())),
        }

        let (command_tx, command_rx) = mpsc::channel(1000);
        let open = Arc::new(AtomicBool::new(true));

        let link = LinkTask {
            read_half,
            write_half,
            read_buf,
            write_buf: buf,
            pending: HashMap::new(),
            next_packet_id: 1,
            keepalive: Duration::from_secs(u64::from(options.keepalive.max(1))),
        };
        let task_open = open.clone();
        tokio::spawn(async move {
            let result = link.run(command_rx, &events, epoch).await;
            task_open.store(false, Ordering::SeqCst);
            if let Err(e) = result {
                warn!("MQTT: link {} dropped: {}", epoch, e);
                let _ = events.send(TransportEvent::StateChanged {
                    epoch,
                    state: LinkState::Disconnected,
                    error: Some(e),
                });
            }
        });

        Ok(Arc::new(MqttConnection {
            command_tx,
            open,
            ack_timeout: options.ack_timeout,
        }))
    }
}

async fn write_packet(
    write_half: &mut OwnedWriteHalf,
    buf: &mut BytesMut,
    packet: &Packet,
) -> Result<(), TransportError> {
    buf.clear();
    codec::encode(packet, buf).map_err(|e| TransportError::Other(format!("Encode error: {}", e)))?;
    write_half.write_all(buf).await?;
    Ok(())
}

async fn read_packet(
    read_half: &mut OwnedReadHalf,
    read_buf: &mut BytesMut,
) -> Result<Packet, TransportError> {
    loop {
        if let Some((packet, used)) = codec::decode(&read_buf[..])
            .map_err(|e| TransportError::Other(format!("Decode error: {}", e)))?
        {
            read_buf.advance(used);
            return Ok(packet);
        }
        if read_half.read_buf(read_buf).await? == 0 {
            return Err(TransportError::ConnectionLost(
                "Connection closed".to_string(),
            ));
        }
    }
}

/// State owned by the per-connection task
struct LinkTask {
    read_half: OwnedReadHalf,
    write_half: OwnedWriteHalf,
    read_buf: BytesMut,
    write_buf: BytesMut,
    /// Outstanding SUBSCRIBE/UNSUBSCRIBE by packet id
    pending: HashMap<u16, Reply>,
    next_packet_id: u16,
    keepalive: Duration,
}

impl LinkTask {
    fn next_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        if self.next_packet_id == 0 {
            self.next_packet_id = 1;
        }
        id
    }

    /// Forget requests whose caller stopped waiting (ack timeout)
    fn prune_abandoned(&mut self) {
        let before = self.pending.len();
        self.pending.retain(|_, reply| !reply.is_closed());
        let pruned = before - self.pending.len();
        if pruned > 0 {
            debug!("MQTT: dropped {} unacknowledged request(s)", pruned);
        }
    }

    fn track(&mut self, packet_id: u16, reply: Reply) {
        self.prune_abandoned();
        self.pending.insert(packet_id, reply);
    }

    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<LinkCommand>,
        events: &EventSender,
        epoch: u64,
    ) -> Result<(), TransportError> {
        let result = self.run_inner(&mut command_rx, events, epoch).await;

        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(TransportError::ConnectionLost(
                "Link closed before acknowledgement".to_string(),
            )));
        }
        result
    }

    async fn run_inner(
        &mut self,
        command_rx: &mut mpsc::Receiver<LinkCommand>,
        events: &EventSender,
        epoch: u64,
    ) -> Result<(), TransportError> {
        // Packets that arrived together with CONNACK
        self.drain_packets(events, epoch)?;

        let mut keepalive_timer = tokio::time::interval(self.keepalive);
        keepalive_timer.reset();

        loop {
            tokio::select! {
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(LinkCommand::Subscribe { channel, reply }) => {
                            let packet_id = self.next_packet_id();
                            let packet = Packet::Subscribe { packet_id, filters: vec![channel] };
                            write_packet(&mut self.write_half, &mut self.write_buf, &packet).await?;
                            self.track(packet_id, reply);
                        }
                        Some(LinkCommand::Unsubscribe { channel, reply }) => {
                            let packet_id = self.next_packet_id();
                            let packet = Packet::Unsubscribe { packet_id, filters: vec![channel] };
                            write_packet(&mut self.write_half, &mut self.write_buf, &packet).await?;
                            self.track(packet_id, reply);
                        }
                        Some(LinkCommand::Publish { channel, payload, reply }) => {
                            let packet = Packet::Publish { topic: channel, payload };
                            let result =
                                write_packet(&mut self.write_half, &mut self.write_buf, &packet).await;
                            let failed = result.as_ref().err().cloned();
                            let _ = reply.send(result);
                            if let Some(e) = failed {
                                return Err(e);
                            }
                        }
                        Some(LinkCommand::Shutdown) | None => {
                            let _ = write_packet(&mut self.write_half, &mut self.write_buf, &Packet::Disconnect).await;
                            let _ = self.write_half.shutdown().await;
                            debug!("MQTT: link {} closed locally", epoch);
                            return Ok(());
                        }
                    }
                }

                result = self.read_half.read_buf(&mut self.read_buf) => {
                    if result? == 0 {
                        return Err(TransportError::ConnectionLost("Connection closed".to_string()));
                    }
                    self.drain_packets(events, epoch)?;
                }

                _ = keepalive_timer.tick() => {
                    self.prune_abandoned();
                    write_packet(&mut self.write_half, &mut self.write_buf, &Packet::PingReq).await?;
                }
            }
        }
    }

    fn drain_packets(&mut self, events: &EventSender, epoch: u64) -> Result<(), TransportError> {
        while let Some((packet, used)) = codec::decode(&self.read_buf)
            .map_err(|e| TransportError::Other(format!("Decode error: {}", e)))?
        {
            self.read_buf.advance(used);
            self.handle_packet(packet, events, epoch)?;
        }
        Ok(())
    }

    fn handle_packet(
        &mut self,
        packet: Packet,
        events: &EventSender,
        epoch: u64,
    ) -> Result<(), TransportError> {
        match packet {
            Packet::Publish { topic, payload } => {
                let _ = events.send(TransportEvent::Message {
                    epoch,
                    channel: topic,
                    payload,
                });
            }
            Packet::SubAck {
                packet_id,
                return_codes,
            } => {
                let result = if return_codes.iter().any(|&c| c == SUBACK_FAILURE) {
                    Err(TransportError::Rejected {
                        code: Some(u32::from(SUBACK_FAILURE)),
                        message: "Subscription refused".to_string(),
                    })
                } else {
                    Ok(())
                };
                match self.pending.remove(&packet_id) {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => debug!("MQTT: SUBACK for unknown packet {}", packet_id),
                }
            }
            Packet::UnsubAck { packet_id } => {
                if let Some(reply) = self.pending.remove(&packet_id) {
                    let _ = reply.send(Ok(()));
                }
            }
            Packet::PingResp => {
                debug!("MQTT: PINGRESP received");
            }
            Packet::Disconnect => {
                return Err(TransportError::ConnectionLost(
                    "Remote disconnected".to_string(),
                ));
            }
            other => {
                debug!("MQTT: ignoring unexpected {:?}", other);
            }
        }
        Ok(())
    }
}

/// Handle to a running MQTT link
pub struct MqttConnection {
    command_tx: mpsc::Sender<LinkCommand>,
    open: Arc<AtomicBool>,
    ack_timeout: Duration,
}

impl MqttConnection {
    async fn request(
        &self,
        make: impl FnOnce(Reply) -> LinkCommand,
    ) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| TransportError::Closed)?;

        match timeout(self.ack_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::ConnectionLost(
                "Link task ended".to_string(),
            )),
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

#[async_trait]
impl Connection for MqttConnection {
    async fn subscribe(&self, channel: &str) -> Result<(), TransportError> {
        let channel = channel.to_string();
        self.request(|reply| LinkCommand::Subscribe { channel, reply })
            .await
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), TransportError> {
        let channel = channel.to_string();
        self.request(|reply| LinkCommand::Unsubscribe { channel, reply })
            .await
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), TransportError> {
        let channel = channel.to_string();
        self.request(|reply| LinkCommand::Publish {
            channel,
            payload,
            reply,
        })
        .await
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.command_tx.send(LinkCommand::Shutdown).await;
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.command_tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn link_task() -> (LinkTask, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (read_half, write_half) = client.into_split();
        let task = LinkTask {
            read_half,
            write_half,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            pending: HashMap::new(),
            next_packet_id: 1,
            keepalive: Duration::from_secs(60),
        };
        (task, server)
    }

    #[tokio::test]
    async fn test_timed_out_requests_are_forgotten() {
        let (mut task, _server) = link_task().await;

        let (abandoned, rx) = oneshot::channel();
        drop(rx);
        task.track(1, abandoned);
        let (waiting, mut waiting_rx) = oneshot::channel();
        task.track(2, waiting);
        assert_eq!(task.pending.len(), 1);
        assert!(task.pending.contains_key(&2));

        let (late, late_rx) = oneshot::channel();
        task.track(3, late);
        drop(late_rx);
        task.prune_abandoned();
        assert_eq!(task.pending.len(), 1);
        assert!(waiting_rx.try_recv().is_err());
    }
}
