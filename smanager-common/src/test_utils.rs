//! Scripted in-process MQTT broker for tests.
//!
//! [`LoopbackBroker`] speaks just enough MQTT 3.1.1 to drive a
//! [`Connection`](crate::Connection) through its lifecycle without a real
//! broker: CONNACK with a chosen return code, SUBACK with scripted grants,
//! PUBACK/PUBCOMP for client publishes, server-side PUBLISH pushes and
//! dropped links. Each accepted TCP session consumes one [`SessionScript`];
//! once the scripts run out the listener is closed, so further connection
//! attempts are refused.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// SUBACK return code granting QoS 1.
pub const SUBACK_GRANTED: u8 = 0x01;

/// SUBACK return code refusing the subscription.
pub const SUBACK_FAILURE: u8 = 0x80;

/// CONNACK return code for "not authorized".
pub const CONNACK_NOT_AUTHORIZED: u8 = 0x05;

/// Behaviour of the broker for one client session.
#[derive(Debug, Clone, Default)]
pub struct SessionScript {
    /// CONNACK return code; anything but `0` refuses the session.
    pub connack_code: u8,
    /// Return codes for successive SUBSCRIBE packets. Subscriptions past
    /// the end of the list are granted.
    pub suback_codes: Vec<u8>,
    /// Messages pushed to the client right after CONNACK.
    pub backlog: Vec<(String, Vec<u8>)>,
    /// Messages pushed after every granted subscription.
    pub after_subscribe: Vec<(String, Vec<u8>)>,
    /// Drop the link once this many SUBACKs were sent.
    pub close_after_subacks: Option<usize>,
}

impl SessionScript {
    /// A session that accepts everything and stays open.
    pub fn accept() -> Self {
        Self::default()
    }

    /// A session refused at CONNACK with `code`.
    pub fn refuse(code: u8) -> Self {
        Self {
            connack_code: code,
            ..Self::default()
        }
    }

    /// Drop the link right after the first SUBACK.
    pub fn drop_after_subscribe(mut self) -> Self {
        self.close_after_subacks = Some(1);
        self
    }

    pub fn with_suback_codes(mut self, codes: impl Into<Vec<u8>>) -> Self {
        self.suback_codes = codes.into();
        self
    }

    pub fn with_backlog(mut self, topic: &str, payloads: &[&str]) -> Self {
        self.backlog
            .extend(payloads.iter().map(|p| (topic.to_string(), p.as_bytes().to_vec())));
        self
    }

    pub fn with_after_subscribe(mut self, topic: &str, payloads: &[&str]) -> Self {
        self.after_subscribe
            .extend(payloads.iter().map(|p| (topic.to_string(), p.as_bytes().to_vec())));
        self
    }
}

/// What the broker observed.
#[derive(Debug, Default)]
struct BrokerLog {
    sessions: usize,
    subscribes: usize,
    published: Vec<(String, Vec<u8>)>,
}

/// A scripted broker listening on an ephemeral loopback port.
pub struct LoopbackBroker {
    addr: SocketAddr,
    log: Arc<Mutex<BrokerLog>>,
    acceptor: JoinHandle<()>,
}

impl LoopbackBroker {
    /// Bind a loopback port and serve one script per accepted session.
    pub async fn start(scripts: Vec<SessionScript>) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let log = Arc::new(Mutex::new(BrokerLog::default()));

        let acceptor = {
            let log = log.clone();
            tokio::spawn(async move {
                for script in scripts {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    log.lock().sessions += 1;
                    let log = log.clone();
                    tokio::spawn(async move {
                        let _ = serve(stream, script, log).await;
                    });
                }
            })
        };

        Ok(Self {
            addr,
            log,
            acceptor,
        })
    }

    /// Broker address as `host:port`.
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Sessions accepted so far.
    pub fn sessions(&self) -> usize {
        self.log.lock().sessions
    }

    /// SUBSCRIBE packets received so far.
    pub fn subscribes(&self) -> usize {
        self.log.lock().subscribes
    }

    /// Client publishes received so far, as `(topic, payload)`.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.log.lock().published.clone()
    }
}

impl Drop for LoopbackBroker {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

async fn serve(
    mut stream: TcpStream,
    script: SessionScript,
    log: Arc<Mutex<BrokerLog>>,
) -> io::Result<()> {
    let (header, _) = read_packet(&mut stream).await?;
    if header >> 4 != 1 {
        return Ok(());
    }

    stream
        .write_all(&[0x20, 0x02, 0x00, script.connack_code])
        .await?;
    if script.connack_code != 0 {
        return Ok(());
    }

    for (topic, payload) in &script.backlog {
        stream.write_all(&publish_packet(topic, payload)).await?;
    }

    let mut subacks = 0;
    loop {
        let (header, body) = read_packet(&mut stream).await?;
        // Packet id for acks, topic length for PUBLISH
        let lead = [
            body.first().copied().unwrap_or(0),
            body.get(1).copied().unwrap_or(0),
        ];

        match header >> 4 {
            // SUBSCRIBE
            8 => {
                let code = script
                    .suback_codes
                    .get(subacks)
                    .copied()
                    .unwrap_or(SUBACK_GRANTED);
                subacks += 1;
                log.lock().subscribes += 1;

                stream.write_all(&[0x90, 0x03, lead[0], lead[1], code]).await?;
                if code != SUBACK_FAILURE {
                    for (topic, payload) in &script.after_subscribe {
                        stream.write_all(&publish_packet(topic, payload)).await?;
                    }
                }
                if script.close_after_subacks == Some(subacks) {
                    return Ok(());
                }
            }
            // PUBLISH
            3 => {
                let qos = (header >> 1) & 0x03;
                let topic_end = (2 + usize::from(u16::from_be_bytes(lead))).min(body.len());
                let topic = body.get(2..topic_end).unwrap_or_default();
                let topic = String::from_utf8_lossy(topic).into_owned();
                let mut offset = topic_end;
                let mut ack_id = [0, 0];
                if qos > 0 && offset + 2 <= body.len() {
                    ack_id = [body[offset], body[offset + 1]];
                    offset += 2;
                }
                log.lock()
                    .published
                    .push((topic, body[offset.min(body.len())..].to_vec()));

                match qos {
                    1 => stream.write_all(&[0x40, 0x02, ack_id[0], ack_id[1]]).await?,
                    2 => stream.write_all(&[0x50, 0x02, ack_id[0], ack_id[1]]).await?,
                    _ => {}
                }
            }
            // PUBREL
            6 => stream.write_all(&[0x70, 0x02, lead[0], lead[1]]).await?,
            // PINGREQ
            12 => stream.write_all(&[0xD0, 0x00]).await?,
            // DISCONNECT
            14 => return Ok(()),
            _ => {}
        }
    }
}

/// Read one packet as `(fixed header byte, body)`.
async fn read_packet(stream: &mut TcpStream) -> io::Result<(u8, Vec<u8>)> {
    let header = stream.read_u8().await?;

    let mut remaining = 0usize;
    for shift in (0..28).step_by(7) {
        let byte = stream.read_u8().await?;
        remaining |= usize::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            break;
        }
    }

    let mut body = vec![0; remaining];
    stream.read_exact(&mut body).await?;
    Ok((header, body))
}

/// Encode a QoS 0 PUBLISH.
fn publish_packet(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut remaining = 2 + topic.len() + payload.len();
    let mut packet = vec![0x30];
    loop {
        let mut byte = (remaining % 128) as u8;
        remaining /= 128;
        if remaining > 0 {
            byte |= 0x80;
        }
        packet.push(byte);
        if remaining == 0 {
            break;
        }
    }

    packet.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    packet.extend_from_slice(topic.as_bytes());
    packet.extend_from_slice(payload);
    packet
}
