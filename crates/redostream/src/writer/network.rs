//! Network sink: length-prefixed frames over TCP.
//!
//! Wire format: 8-byte little-endian payload size followed by the payload
//! bytes. Connection loss surfaces as a retriable error; the writer's
//! retry loop calls `publish` again and the sink reconnects.

use crate::common::{Error, Result};
use crate::ring::Frame;
use crate::writer::Sink;
use std::io::Write;
use std::net::TcpStream;
use tracing::{info, warn};

pub struct NetworkSink {
    address: String,
    stream: Option<TcpStream>,
}

impl NetworkSink {
    pub fn new(address: impl Into<String>) -> NetworkSink {
        NetworkSink { address: address.into(), stream: None }
    }

    fn connect(&mut self) -> Result<&mut TcpStream> {
        if self.stream.is_none() {
            let stream = TcpStream::connect(&self.address)
                .map_err(|e| Error::io(10061, format!("connect: {}", self.address), e))?;
            stream
                .set_nodelay(true)
                .map_err(|e| Error::io(10061, format!("connect: {}", self.address), e))?;
            info!(address = %self.address, "network sink connected");
            self.stream = Some(stream);
        }
        Ok(self.stream.as_mut().expect("connected above"))
    }
}

impl Sink for NetworkSink {
    fn kind(&self) -> &'static str {
        "network"
    }

    fn initialize(&mut self) -> Result<()> {
        self.connect().map(|_| ())
    }

    fn publish(&mut self, frame: &Frame) -> Result<()> {
        let address = self.address.clone();
        let stream = self.connect()?;
        let result = (|| -> std::io::Result<()> {
            stream.write_all(&(frame.payload.len() as u64).to_le_bytes())?;
            stream.write_all(&frame.payload)?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!(address = %address, "network write failed, dropping connection");
            self.stream = None;
            return Err(Error::io(10062, format!("write: {address}"), e));
        }
        Ok(())
    }

    fn confirm(&mut self, _frame: &Frame) -> Result<()> {
        if let Some(stream) = &mut self.stream {
            stream
                .flush()
                .map_err(|e| Error::io(10062, format!("flush: {}", self.address), e))?;
        }
        Ok(())
    }
}
