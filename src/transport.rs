// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
//
//! The socket the core consumes (spec.md §6, "raw TCP socket I/O" is out of
//! scope for this crate; this trait is the narrow seam between the Framer
//! and whatever owns the wire). A blocking `TcpTransport` default is
//! supplied since the concurrency model (spec.md §5) is explicit threads.
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Status of the underlying socket, as consumed by the reader thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ready,
    Closed,
    RequestingClose,
}

/// The external collaborator that owns the duplex byte stream.
pub trait Transport: Send {
    fn send(&mut self, buf: &[u8]) -> io::Result<()>;
    /// Reads at least one byte, at most `buf.len()`, returning the number of
    /// bytes read (0 meaning EOF).
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn shutdown(&mut self) -> io::Result<()>;
    fn status(&self) -> Status;
    /// A second handle onto the same duplex stream. The connection's single
    /// reader thread keeps one handle to itself so a blocking `recv` never
    /// stalls a concurrent writer (spec.md §5: the outbound socket, not the
    /// inbound one, is the resource shared and serialized between writers).
    fn try_clone(&self) -> io::Result<Box<dyn Transport>>;
}

/// Default blocking TCP transport.
pub struct TcpTransport {
    stream: TcpStream,
    status: Status,
}

impl TcpTransport {
    pub fn connect<A: ToSocketAddrs>(addr: A, timeout: Option<Duration>) -> io::Result<Self> {
        let stream = if let Some(timeout) = timeout {
            let addr = addr
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address"))?;
            TcpStream::connect_timeout(&addr, timeout)?
        } else {
            TcpStream::connect(addr)?
        };
        stream.set_nodelay(true)?;
        Ok(TcpTransport {
            stream,
            status: Status::Ready,
        })
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, buf: &[u8]) -> io::Result<()> {
        self.stream.write_all(buf)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stream.read(buf)?;
        if n == 0 {
            self.status = Status::Closed;
        }
        Ok(n)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.status = Status::RequestingClose;
        let r = self.stream.shutdown(Shutdown::Both);
        self.status = Status::Closed;
        r
    }

    fn status(&self) -> Status {
        self.status
    }

    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        let stream = self.stream.try_clone()?;
        Ok(Box::new(TcpTransport { stream, status: self.status }))
    }
}

#[cfg(test)]
pub(crate) mod test_pipe {
    use super::*;
    use std::sync::mpsc::{Receiver, Sender};

    /// An in-memory duplex pipe standing in for a socket in tests.
    pub struct PipeTransport {
        pub tx: Sender<Vec<u8>>,
        pub rx: Receiver<Vec<u8>>,
        pub pending: Vec<u8>,
        pub status: Status,
    }

    impl Transport for PipeTransport {
        fn send(&mut self, buf: &[u8]) -> io::Result<()> {
            self.tx
                .send(buf.to_vec())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
        }

        fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pending.is_empty() {
                match self.rx.recv() {
                    Ok(chunk) => self.pending = chunk,
                    Err(_) => {
                        self.status = Status::Closed;
                        return Ok(0);
                    }
                }
            }
            let n = std::cmp::min(buf.len(), self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }

        fn shutdown(&mut self) -> io::Result<()> {
            self.status = Status::Closed;
            Ok(())
        }

        fn status(&self) -> Status {
            self.status
        }

        fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
            // Write-only clone: recv() on it is never expected to be called
            // since the reader thread keeps the original handle.
            let (_dummy_tx, dummy_rx) = std::sync::mpsc::channel();
            Ok(Box::new(PipeTransport {
                tx: self.tx.clone(),
                rx: dummy_rx,
                pending: Vec::new(),
                status: self.status,
            }))
        }
    }

    pub fn pair() -> (PipeTransport, PipeTransport) {
        let (tx_a, rx_b) = std::sync::mpsc::channel();
        let (tx_b, rx_a) = std::sync::mpsc::channel();
        (
            PipeTransport {
                tx: tx_a,
                rx: rx_a,
                pending: Vec::new(),
                status: Status::Ready,
            },
            PipeTransport {
                tx: tx_b,
                rx: rx_b,
                pending: Vec::new(),
                status: Status::Ready,
            },
        )
    }
}
