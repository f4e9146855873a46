use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{Frame, FrameKind};
use crate::error::{FrameError, Result};

/// A method identity: class id plus method id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId {
    pub class_id: u16,
    pub method_id: u16,
}

impl MethodId {
    pub const CONNECTION_OPEN: Self = Self::new(10, 40);
    pub const CONNECTION_OPEN_OK: Self = Self::new(10, 41);
    pub const CONNECTION_CLOSE: Self = Self::new(10, 50);
    pub const CONNECTION_CLOSE_OK: Self = Self::new(10, 51);

    pub const CHANNEL_OPEN: Self = Self::new(20, 10);
    pub const CHANNEL_OPEN_OK: Self = Self::new(20, 11);
    pub const CHANNEL_FLOW: Self = Self::new(20, 20);
    pub const CHANNEL_FLOW_OK: Self = Self::new(20, 21);
    pub const CHANNEL_CLOSE: Self = Self::new(20, 40);
    pub const CHANNEL_CLOSE_OK: Self = Self::new(20, 41);

    pub const EXCHANGE_DECLARE: Self = Self::new(40, 10);
    pub const EXCHANGE_DECLARE_OK: Self = Self::new(40, 11);
    pub const EXCHANGE_DELETE: Self = Self::new(40, 20);
    pub const EXCHANGE_DELETE_OK: Self = Self::new(40, 21);
    pub const EXCHANGE_BIND: Self = Self::new(40, 30);
    pub const EXCHANGE_BIND_OK: Self = Self::new(40, 31);
    pub const EXCHANGE_UNBIND: Self = Self::new(40, 40);
    pub const EXCHANGE_UNBIND_OK: Self = Self::new(40, 51);

    pub const QUEUE_DECLARE: Self = Self::new(50, 10);
    pub const QUEUE_DECLARE_OK: Self = Self::new(50, 11);
    pub const QUEUE_BIND: Self = Self::new(50, 20);
    pub const QUEUE_BIND_OK: Self = Self::new(50, 21);
    pub const QUEUE_PURGE: Self = Self::new(50, 30);
    pub const QUEUE_PURGE_OK: Self = Self::new(50, 31);
    pub const QUEUE_DELETE: Self = Self::new(50, 40);
    pub const QUEUE_DELETE_OK: Self = Self::new(50, 41);
    pub const QUEUE_UNBIND: Self = Self::new(50, 50);
    pub const QUEUE_UNBIND_OK: Self = Self::new(50, 51);

    pub const BASIC_QOS: Self = Self::new(60, 10);
    pub const BASIC_QOS_OK: Self = Self::new(60, 11);
    pub const BASIC_CONSUME: Self = Self::new(60, 20);
    pub const BASIC_CONSUME_OK: Self = Self::new(60, 21);
    pub const BASIC_CANCEL: Self = Self::new(60, 30);
    pub const BASIC_CANCEL_OK: Self = Self::new(60, 31);
    pub const BASIC_PUBLISH: Self = Self::new(60, 40);
    pub const BASIC_DELIVER: Self = Self::new(60, 60);
    pub const BASIC_GET: Self = Self::new(60, 70);
    pub const BASIC_GET_OK: Self = Self::new(60, 71);
    pub const BASIC_GET_EMPTY: Self = Self::new(60, 72);
    pub const BASIC_ACK: Self = Self::new(60, 80);
    pub const BASIC_RECOVER: Self = Self::new(60, 110);
    pub const BASIC_RECOVER_OK: Self = Self::new(60, 111);

    pub const CONFIRM_SELECT: Self = Self::new(85, 10);
    pub const CONFIRM_SELECT_OK: Self = Self::new(85, 11);

    pub const TX_SELECT: Self = Self::new(90, 10);
    pub const TX_SELECT_OK: Self = Self::new(90, 11);
    pub const TX_COMMIT: Self = Self::new(90, 20);
    pub const TX_COMMIT_OK: Self = Self::new(90, 21);
    pub const TX_ROLLBACK: Self = Self::new(90, 30);
    pub const TX_ROLLBACK_OK: Self = Self::new(90, 31);

    pub const fn new(class_id: u16, method_id: u16) -> Self {
        Self {
            class_id,
            method_id,
        }
    }

    /// Dotted AMQP name, if this id is one the table knows.
    pub fn name(self) -> Option<&'static str> {
        NAMES
            .iter()
            .find(|(id, _)| *id == self)
            .map(|(_, name)| *name)
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "{}.{}", self.class_id, self.method_id),
        }
    }
}

const NAMES: &[(MethodId, &str)] = &[
    (MethodId::CONNECTION_OPEN, "connection.open"),
    (MethodId::CONNECTION_OPEN_OK, "connection.open-ok"),
    (MethodId::CONNECTION_CLOSE, "connection.close"),
    (MethodId::CONNECTION_CLOSE_OK, "connection.close-ok"),
    (MethodId::CHANNEL_OPEN, "channel.open"),
    (MethodId::CHANNEL_OPEN_OK, "channel.open-ok"),
    (MethodId::CHANNEL_FLOW, "channel.flow"),
    (MethodId::CHANNEL_FLOW_OK, "channel.flow-ok"),
    (MethodId::CHANNEL_CLOSE, "channel.close"),
    (MethodId::CHANNEL_CLOSE_OK, "channel.close-ok"),
    (MethodId::EXCHANGE_DECLARE, "exchange.declare"),
    (MethodId::EXCHANGE_DECLARE_OK, "exchange.declare-ok"),
    (MethodId::EXCHANGE_DELETE, "exchange.delete"),
    (MethodId::EXCHANGE_DELETE_OK, "exchange.delete-ok"),
    (MethodId::EXCHANGE_BIND, "exchange.bind"),
    (MethodId::EXCHANGE_BIND_OK, "exchange.bind-ok"),
    (MethodId::EXCHANGE_UNBIND, "exchange.unbind"),
    (MethodId::EXCHANGE_UNBIND_OK, "exchange.unbind-ok"),
    (MethodId::QUEUE_DECLARE, "queue.declare"),
    (MethodId::QUEUE_DECLARE_OK, "queue.declare-ok"),
    (MethodId::QUEUE_BIND, "queue.bind"),
    (MethodId::QUEUE_BIND_OK, "queue.bind-ok"),
    (MethodId::QUEUE_PURGE, "queue.purge"),
    (MethodId::QUEUE_PURGE_OK, "queue.purge-ok"),
    (MethodId::QUEUE_DELETE, "queue.delete"),
    (MethodId::QUEUE_DELETE_OK, "queue.delete-ok"),
    (MethodId::QUEUE_UNBIND, "queue.unbind"),
    (MethodId::QUEUE_UNBIND_OK, "queue.unbind-ok"),
    (MethodId::BASIC_QOS, "basic.qos"),
    (MethodId::BASIC_QOS_OK, "basic.qos-ok"),
    (MethodId::BASIC_CONSUME, "basic.consume"),
    (MethodId::BASIC_CONSUME_OK, "basic.consume-ok"),
    (MethodId::BASIC_CANCEL, "basic.cancel"),
    (MethodId::BASIC_CANCEL_OK, "basic.cancel-ok"),
    (MethodId::BASIC_PUBLISH, "basic.publish"),
    (MethodId::BASIC_DELIVER, "basic.deliver"),
    (MethodId::BASIC_GET, "basic.get"),
    (MethodId::BASIC_GET_OK, "basic.get-ok"),
    (MethodId::BASIC_GET_EMPTY, "basic.get-empty"),
    (MethodId::BASIC_ACK, "basic.ack"),
    (MethodId::BASIC_RECOVER, "basic.recover"),
    (MethodId::BASIC_RECOVER_OK, "basic.recover-ok"),
    (MethodId::CONFIRM_SELECT, "confirm.select"),
    (MethodId::CONFIRM_SELECT_OK, "confirm.select-ok"),
    (MethodId::TX_SELECT, "tx.select"),
    (MethodId::TX_SELECT_OK, "tx.select-ok"),
    (MethodId::TX_COMMIT, "tx.commit"),
    (MethodId::TX_COMMIT_OK, "tx.commit-ok"),
    (MethodId::TX_ROLLBACK, "tx.rollback"),
    (MethodId::TX_ROLLBACK_OK, "tx.rollback-ok"),
];

/// Client-sent synchronous methods and the replies that complete them.
const SYNC_TABLE: &[(MethodId, &[MethodId])] = &[
    (MethodId::CONNECTION_OPEN, &[MethodId::CONNECTION_OPEN_OK]),
    (MethodId::CONNECTION_CLOSE, &[MethodId::CONNECTION_CLOSE_OK]),
    (MethodId::CHANNEL_OPEN, &[MethodId::CHANNEL_OPEN_OK]),
    (MethodId::CHANNEL_FLOW, &[MethodId::CHANNEL_FLOW_OK]),
    (MethodId::CHANNEL_CLOSE, &[MethodId::CHANNEL_CLOSE_OK]),
    (MethodId::EXCHANGE_DECLARE, &[MethodId::EXCHANGE_DECLARE_OK]),
    (MethodId::EXCHANGE_DELETE, &[MethodId::EXCHANGE_DELETE_OK]),
    (MethodId::EXCHANGE_BIND, &[MethodId::EXCHANGE_BIND_OK]),
    (MethodId::EXCHANGE_UNBIND, &[MethodId::EXCHANGE_UNBIND_OK]),
    (MethodId::QUEUE_DECLARE, &[MethodId::QUEUE_DECLARE_OK]),
    (MethodId::QUEUE_BIND, &[MethodId::QUEUE_BIND_OK]),
    (MethodId::QUEUE_PURGE, &[MethodId::QUEUE_PURGE_OK]),
    (MethodId::QUEUE_DELETE, &[MethodId::QUEUE_DELETE_OK]),
    (MethodId::QUEUE_UNBIND, &[MethodId::QUEUE_UNBIND_OK]),
    (MethodId::BASIC_QOS, &[MethodId::BASIC_QOS_OK]),
    (MethodId::BASIC_CONSUME, &[MethodId::BASIC_CONSUME_OK]),
    (MethodId::BASIC_CANCEL, &[MethodId::BASIC_CANCEL_OK]),
    (
        MethodId::BASIC_GET,
        &[MethodId::BASIC_GET_OK, MethodId::BASIC_GET_EMPTY],
    ),
    (MethodId::BASIC_RECOVER, &[MethodId::BASIC_RECOVER_OK]),
    (MethodId::CONFIRM_SELECT, &[MethodId::CONFIRM_SELECT_OK]),
    (MethodId::TX_SELECT, &[MethodId::TX_SELECT_OK]),
    (MethodId::TX_COMMIT, &[MethodId::TX_COMMIT_OK]),
    (MethodId::TX_ROLLBACK, &[MethodId::TX_ROLLBACK_OK]),
];

/// Valid replies for a synchronous method, or `None` if `id` is asynchronous.
pub fn sync_responses(id: MethodId) -> Option<&'static [MethodId]> {
    SYNC_TABLE
        .iter()
        .find(|(request, _)| *request == id)
        .map(|(_, replies)| *replies)
}

/// A decoded protocol method.
///
/// Connection and channel lifecycle methods are typed. Everything else
/// travels as [`Method::Other`] with its argument bytes left opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    ConnectionClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ConnectionCloseOk,
    ChannelOpen,
    ChannelOpenOk,
    ChannelFlow {
        active: bool,
    },
    ChannelFlowOk {
        active: bool,
    },
    ChannelClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ChannelCloseOk,
    Other {
        id: MethodId,
        arguments: Bytes,
        /// Set when `arguments` carry a raised no-wait bit. The broker sends
        /// no reply then, so the exchange is fire-and-forget.
        no_wait: bool,
    },
}

impl Method {
    /// `Channel.Close` with the given reply, not caused by a failing method.
    pub fn channel_close(reply_code: u16, reply_text: impl Into<String>) -> Self {
        Method::ChannelClose {
            reply_code,
            reply_text: reply_text.into(),
            class_id: 0,
            method_id: 0,
        }
    }

    /// `Connection.Close` with the given reply, not caused by a failing method.
    pub fn connection_close(reply_code: u16, reply_text: impl Into<String>) -> Self {
        Method::ConnectionClose {
            reply_code,
            reply_text: reply_text.into(),
            class_id: 0,
            method_id: 0,
        }
    }

    /// An untyped method with pre-encoded arguments.
    pub fn other(id: MethodId, arguments: impl Into<Bytes>) -> Self {
        Method::Other {
            id,
            arguments: arguments.into(),
            no_wait: false,
        }
    }

    /// An untyped method whose arguments request no-wait.
    pub fn other_no_wait(id: MethodId, arguments: impl Into<Bytes>) -> Self {
        Method::Other {
            id,
            arguments: arguments.into(),
            no_wait: true,
        }
    }

    /// Class and method id this method encodes as.
    pub fn id(&self) -> MethodId {
        match self {
            Method::ConnectionClose { .. } => MethodId::CONNECTION_CLOSE,
            Method::ConnectionCloseOk => MethodId::CONNECTION_CLOSE_OK,
            Method::ChannelOpen => MethodId::CHANNEL_OPEN,
            Method::ChannelOpenOk => MethodId::CHANNEL_OPEN_OK,
            Method::ChannelFlow { .. } => MethodId::CHANNEL_FLOW,
            Method::ChannelFlowOk { .. } => MethodId::CHANNEL_FLOW_OK,
            Method::ChannelClose { .. } => MethodId::CHANNEL_CLOSE,
            Method::ChannelCloseOk => MethodId::CHANNEL_CLOSE_OK,
            Method::Other { id, .. } => *id,
        }
    }

    /// True if the sender must wait for one of [`Method::valid_responses`].
    pub fn is_synchronous(&self) -> bool {
        match self {
            Method::Other { no_wait: true, .. } => false,
            _ => sync_responses(self.id()).is_some(),
        }
    }

    /// Replies that complete this method; empty for asynchronous methods.
    pub fn valid_responses(&self) -> &'static [MethodId] {
        if !self.is_synchronous() {
            return &[];
        }
        sync_responses(self.id()).unwrap_or(&[])
    }

    /// Encode class id, method id and arguments into `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        let id = self.id();
        dst.put_u16(id.class_id);
        dst.put_u16(id.method_id);

        match self {
            Method::ConnectionClose {
                reply_code,
                reply_text,
                class_id,
                method_id,
            }
            | Method::ChannelClose {
                reply_code,
                reply_text,
                class_id,
                method_id,
            } => {
                dst.put_u16(*reply_code);
                put_short_str(dst, reply_text)?;
                dst.put_u16(*class_id);
                dst.put_u16(*method_id);
            }
            Method::ConnectionCloseOk | Method::ChannelCloseOk => {}
            // reserved-1 shortstr
            Method::ChannelOpen => put_short_str(dst, "")?,
            // reserved-1 longstr
            Method::ChannelOpenOk => dst.put_u32(0),
            Method::ChannelFlow { active } | Method::ChannelFlowOk { active } => {
                dst.put_u8(u8::from(*active));
            }
            Method::Other { arguments, .. } => dst.put_slice(arguments),
        }
        Ok(())
    }

    /// Decode a method frame payload.
    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let class_id = get_u16(&mut payload, "class id")?;
        let method_id = get_u16(&mut payload, "method id")?;
        let id = MethodId::new(class_id, method_id);

        let method = match id {
            MethodId::CONNECTION_CLOSE | MethodId::CHANNEL_CLOSE => {
                let reply_code = get_u16(&mut payload, "reply-code")?;
                let reply_text = get_short_str(&mut payload, "reply-text")?;
                let class_id = get_u16(&mut payload, "class-id")?;
                let method_id = get_u16(&mut payload, "method-id")?;
                if id == MethodId::CONNECTION_CLOSE {
                    Method::ConnectionClose {
                        reply_code,
                        reply_text,
                        class_id,
                        method_id,
                    }
                } else {
                    Method::ChannelClose {
                        reply_code,
                        reply_text,
                        class_id,
                        method_id,
                    }
                }
            }
            MethodId::CONNECTION_CLOSE_OK => Method::ConnectionCloseOk,
            MethodId::CHANNEL_CLOSE_OK => Method::ChannelCloseOk,
            MethodId::CHANNEL_OPEN => {
                get_short_str(&mut payload, "reserved-1")?;
                Method::ChannelOpen
            }
            MethodId::CHANNEL_OPEN_OK => {
                let len = get_u32(&mut payload, "reserved-1")? as usize;
                skip(&mut payload, len, "reserved-1")?;
                Method::ChannelOpenOk
            }
            MethodId::CHANNEL_FLOW => Method::ChannelFlow {
                active: get_u8(&mut payload, "active")? & 1 == 1,
            },
            MethodId::CHANNEL_FLOW_OK => Method::ChannelFlowOk {
                active: get_u8(&mut payload, "active")? & 1 == 1,
            },
            _ => {
                return Ok(Method::Other {
                    id,
                    arguments: payload,
                    no_wait: false,
                })
            }
        };

        if payload.has_remaining() {
            return Err(FrameError::Malformed(format!(
                "{id}: {} trailing bytes",
                payload.remaining()
            )));
        }
        Ok(method)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::ConnectionClose {
                reply_code,
                reply_text,
                ..
            }
            | Method::ChannelClose {
                reply_code,
                reply_text,
                ..
            } => write!(f, "{} ({reply_code} {reply_text})", self.id()),
            _ => write!(f, "{}", self.id()),
        }
    }
}

/// A decoded method frame: a method and the channel it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodFrame {
    pub channel: u16,
    pub method: Method,
}

impl MethodFrame {
    /// Pair a method with the channel it travels on.
    pub fn new(channel: u16, method: Method) -> Self {
        Self { channel, method }
    }

    /// Class and method id of the carried method.
    pub fn id(&self) -> MethodId {
        self.method.id()
    }

    /// Encode into a raw method frame.
    pub fn to_frame(&self) -> Result<Frame> {
        let mut payload = BytesMut::with_capacity(64);
        self.method.encode(&mut payload)?;
        Ok(Frame::new(FrameKind::Method, self.channel, payload.freeze()))
    }
}

impl TryFrom<Frame> for MethodFrame {
    type Error = FrameError;

    fn try_from(frame: Frame) -> Result<Self> {
        if frame.kind != FrameKind::Method {
            return Err(FrameError::Malformed(format!(
                "expected a method frame, got {:?}",
                frame.kind
            )));
        }
        Ok(Self {
            channel: frame.channel,
            method: Method::decode(frame.payload)?,
        })
    }
}

fn put_short_str(dst: &mut BytesMut, value: &str) -> Result<()> {
    let len = u8::try_from(value.len()).map_err(|_| {
        FrameError::Malformed(format!("short string too long ({} bytes)", value.len()))
    })?;
    dst.put_u8(len);
    dst.put_slice(value.as_bytes());
    Ok(())
}

fn ensure(src: &Bytes, needed: usize, field: &str) -> Result<()> {
    if src.remaining() < needed {
        return Err(FrameError::Malformed(format!(
            "truncated {field}: need {needed} bytes, have {}",
            src.remaining()
        )));
    }
    Ok(())
}

fn get_u8(src: &mut Bytes, field: &str) -> Result<u8> {
    ensure(src, 1, field)?;
    Ok(src.get_u8())
}

fn get_u16(src: &mut Bytes, field: &str) -> Result<u16> {
    ensure(src, 2, field)?;
    Ok(src.get_u16())
}

fn get_u32(src: &mut Bytes, field: &str) -> Result<u32> {
    ensure(src, 4, field)?;
    Ok(src.get_u32())
}

fn skip(src: &mut Bytes, len: usize, field: &str) -> Result<()> {
    ensure(src, len, field)?;
    src.advance(len);
    Ok(())
}

fn get_short_str(src: &mut Bytes, field: &str) -> Result<String> {
    let len = get_u8(src, field)? as usize;
    ensure(src, len, field)?;
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| FrameError::Malformed(format!("{field} is not valid UTF-8")))
}
