//! Codec for reading and writing framed xic messages on a byte stream.

use crate::{
    error::ProtocolError,
    message::{Message, MessageHeader, HEADER_SIZE},
};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

/// Reads and writes whole messages.
///
/// The body buffer is reused across reads. Only the connection's read loop reads, so one
/// codec per connection is enough.
#[derive(Debug)]
pub struct MessageCodec {
    /// Buffer for the body of the message being read.
    body_buffer: Vec<u8>,
    /// Maximum allowed body size.
    max_message_size: u32,
}

impl MessageCodec {
    /// Create a new codec with the given maximum body size.
    pub fn new(max_message_size: u32) -> Self {
        Self { body_buffer: Vec::new(), max_message_size }
    }

    /// The maximum body size this codec accepts.
    pub fn max_message_size(&self) -> u32 {
        self.max_message_size
    }

    /// Read and validate a message header.
    pub async fn read_header<R>(&mut self, reader: &mut R) -> Result<MessageHeader, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header_buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_buf).await?;
        MessageHeader::decode(&header_buf, self.max_message_size)
    }

    /// Read exactly `header.body_size` bytes and decode the typed message.
    pub async fn read_body<R>(
        &mut self,
        reader: &mut R,
        header: &MessageHeader,
    ) -> Result<Message, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        // size was validated against max_message_size by the header
        self.body_buffer.clear();
        self.body_buffer.resize(header.body_size as usize, 0);
        reader.read_exact(&mut self.body_buffer).await?;

        Message::decode(header, &self.body_buffer)
    }

    /// Read a complete message (header + body).
    pub async fn read_message<R>(&mut self, reader: &mut R) -> Result<Message, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let header = self.read_header(reader).await?;
        self.read_body(reader, &header).await
    }

    /// Encode a message and write it with a single `write_all`.
    pub async fn write_message<W>(&self, writer: &mut W, msg: &Message) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let bytes = msg.encode(self.max_message_size)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }
}
