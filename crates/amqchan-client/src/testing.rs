//! Scripted broker over a socket pair, for unit tests.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use amqchan_frame::{Frame, FrameError, FrameReader, FrameWriter, Method, MethodFrame, MethodId};
use amqchan_transport::Stream;

use crate::{Connection, ConnectionConfig};

pub(crate) struct FakeBroker {
    reader: FrameReader<UnixStream>,
    writer: FrameWriter<UnixStream>,
}

impl FakeBroker {
    /// Next method frame from the client; panics after five seconds.
    pub(crate) fn expect(&mut self) -> MethodFrame {
        let frame = self.reader.read_frame().expect("read client frame");
        MethodFrame::try_from(frame).expect("client sent a method frame")
    }

    pub(crate) fn expect_method(&mut self, id: MethodId) -> MethodFrame {
        let frame = self.expect();
        assert_eq!(frame.id(), id, "client sent {frame:?}");
        frame
    }

    pub(crate) fn send(&mut self, channel: u16, method: Method) {
        self.writer
            .send_method(channel, &method)
            .expect("write broker frame");
    }

    pub(crate) fn send_raw(&mut self, frame: Frame) {
        self.writer.write_frame(&frame).expect("write broker frame");
    }

    /// Write bytes that need not form a valid frame.
    pub(crate) fn send_bytes(&mut self, bytes: &[u8]) {
        let mut socket = self.writer.get_ref();
        socket.write_all(bytes).expect("write broker bytes");
    }

    /// Panics unless the client has shut its side of the socket.
    pub(crate) fn expect_eof(&mut self) {
        match self.reader.read_frame() {
            Err(FrameError::ConnectionClosed) => {}
            other => panic!("expected EOF from client, got {other:?}"),
        }
    }

    /// Answer the next `Channel.Open` with `Channel.OpenOk`.
    pub(crate) fn accept_open(&mut self) -> u16 {
        let open = self.expect_method(MethodId::CHANNEL_OPEN);
        self.send(open.channel, Method::ChannelOpenOk);
        open.channel
    }

    /// Answer the next `Channel.Close` with `Channel.CloseOk`.
    pub(crate) fn accept_close(&mut self) -> u16 {
        let close = self.expect_method(MethodId::CHANNEL_CLOSE);
        self.send(close.channel, Method::ChannelCloseOk);
        close.channel
    }
}

pub(crate) fn connect_pair() -> (Connection, FakeBroker) {
    connect_pair_with(ConnectionConfig::default())
}

pub(crate) fn connect_pair_with(config: ConnectionConfig) -> (Connection, FakeBroker) {
    let (client, broker) = UnixStream::pair().expect("socket pair");
    broker
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("broker read timeout");

    let conn = Connection::from_stream(Stream::from_unix(client), config).expect("start connection");
    let broker = FakeBroker {
        reader: FrameReader::new(broker.try_clone().expect("clone broker socket")),
        writer: FrameWriter::new(broker),
    };
    (conn, broker)
}

/// Start a connection and open one channel on it.
pub(crate) fn open_channel_pair() -> (Connection, crate::Channel, FakeBroker) {
    let (conn, mut broker) = connect_pair();
    let opener = {
        let conn = conn.clone();
        std::thread::spawn(move || conn.open_channel())
    };
    broker.accept_open();
    let channel = opener
        .join()
        .expect("opener thread")
        .expect("channel opens");
    (conn, channel, broker)
}
