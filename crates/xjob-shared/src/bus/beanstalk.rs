//! # Beanstalkd Protocol Client
//!
//! Minimal async client for the beanstalkd text protocol, covering exactly
//! what the engine needs: `use`/`put` on the sending side, `watch`/
//! `reserve-with-timeout`/`delete`/`bury` on the consuming side, and
//! `list-tubes` for worker discovery. The daemon answers `list-tubes` in
//! YAML.

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

use crate::errors::{XjobError, XjobResult};

/// Default time-to-run granted to reserved jobs, seconds
const DEFAULT_TTR: u32 = 120;

/// Priority used for put and bury; beanstalkd's conventional "urgent" bound
const DEFAULT_PRIORITY: u32 = 1024;

/// Outcome of a `put`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The job was enqueued
    Inserted(u64),
    /// The daemon refused the job for capacity reasons; try another endpoint
    Full,
}

/// One TCP connection to a beanstalkd endpoint
#[derive(Debug)]
pub struct BeanstalkConnection {
    addr: String,
    stream: BufStream<TcpStream>,
}

impl BeanstalkConnection {
    /// Open a connection to `addr` (`host:port`).
    pub async fn connect(addr: &str) -> XjobResult<Self> {
        let stream = TcpStream::connect(addr).await.map_err(|err| {
            XjobError::bus_unavailable(format!("connect to beanstalkd {addr}: {err}"))
        })?;
        Ok(Self {
            addr: addr.to_string(),
            stream: BufStream::new(stream),
        })
    }

    /// The endpoint this connection talks to
    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn send_line(&mut self, line: &str) -> XjobResult<()> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_reply_line(&mut self) -> XjobResult<String> {
        let mut line = String::new();
        let read = self.stream.read_line(&mut line).await?;
        if read == 0 {
            return Err(XjobError::bus_unavailable(format!(
                "beanstalkd {} closed the connection",
                self.addr
            )));
        }
        Ok(line.trim_end().to_string())
    }

    async fn read_body(&mut self, len: usize) -> XjobResult<Vec<u8>> {
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await?;
        let mut crlf = [0u8; 2];
        self.stream.read_exact(&mut crlf).await?;
        Ok(body)
    }

    fn protocol_error(&self, context: &str, reply: &str) -> XjobError {
        XjobError::bus_unavailable(format!(
            "beanstalkd {}: unexpected reply to {context}: {reply:?}",
            self.addr
        ))
    }

    /// Select the tube subsequent `put` commands go to.
    pub async fn use_tube(&mut self, tube: &str) -> XjobResult<()> {
        self.send_line(&format!("use {tube}")).await?;
        let reply = self.read_reply_line().await?;
        if reply.starts_with("USING ") {
            Ok(())
        } else {
            Err(self.protocol_error("use", &reply))
        }
    }

    /// Add a tube to the watch list and stop watching `default`.
    pub async fn watch(&mut self, tube: &str) -> XjobResult<()> {
        self.send_line(&format!("watch {tube}")).await?;
        let reply = self.read_reply_line().await?;
        if !reply.starts_with("WATCHING ") {
            return Err(self.protocol_error("watch", &reply));
        }

        if tube != "default" {
            self.send_line("ignore default").await?;
            let reply = self.read_reply_line().await?;
            if !reply.starts_with("WATCHING ") && reply != "NOT_IGNORED" {
                return Err(self.protocol_error("ignore", &reply));
            }
        }
        Ok(())
    }

    /// Enqueue one job on the used tube.
    pub async fn put(&mut self, payload: &[u8]) -> XjobResult<PutOutcome> {
        self.stream
            .write_all(
                format!(
                    "put {DEFAULT_PRIORITY} 0 {DEFAULT_TTR} {}\r\n",
                    payload.len()
                )
                .as_bytes(),
            )
            .await?;
        self.stream.write_all(payload).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;

        let reply = self.read_reply_line().await?;
        if let Some(id) = reply.strip_prefix("INSERTED ") {
            let id = id
                .parse()
                .map_err(|_| self.protocol_error("put", &reply))?;
            return Ok(PutOutcome::Inserted(id));
        }
        // BURIED and the capacity replies all mean "this endpoint cannot
        // take more right now".
        if reply.starts_with("BURIED") || reply == "DRAINING" || reply == "OUT_OF_MEMORY" {
            return Ok(PutOutcome::Full);
        }
        Err(self.protocol_error("put", &reply))
    }

    /// Reserve one job, waiting at most `timeout_secs`. `None` on timeout.
    pub async fn reserve_with_timeout(
        &mut self,
        timeout_secs: u64,
    ) -> XjobResult<Option<(u64, Vec<u8>)>> {
        self.send_line(&format!("reserve-with-timeout {timeout_secs}"))
            .await?;
        let reply = self.read_reply_line().await?;

        if reply == "TIMED_OUT" || reply == "DEADLINE_SOON" {
            return Ok(None);
        }
        let Some(rest) = reply.strip_prefix("RESERVED ") else {
            return Err(self.protocol_error("reserve", &reply));
        };
        let (id, len) = rest
            .split_once(' ')
            .ok_or_else(|| self.protocol_error("reserve", &reply))?;
        let id: u64 = id
            .parse()
            .map_err(|_| self.protocol_error("reserve", &reply))?;
        let len: usize = len
            .parse()
            .map_err(|_| self.protocol_error("reserve", &reply))?;

        let body = self.read_body(len).await?;
        Ok(Some((id, body)))
    }

    /// Delete a reserved job.
    pub async fn delete(&mut self, id: u64) -> XjobResult<()> {
        self.send_line(&format!("delete {id}")).await?;
        let reply = self.read_reply_line().await?;
        if reply == "DELETED" || reply == "NOT_FOUND" {
            Ok(())
        } else {
            Err(self.protocol_error("delete", &reply))
        }
    }

    /// Bury a reserved job for later inspection.
    pub async fn bury(&mut self, id: u64) -> XjobResult<()> {
        self.send_line(&format!("bury {id} {DEFAULT_PRIORITY}")).await?;
        let reply = self.read_reply_line().await?;
        if reply == "BURIED" || reply == "NOT_FOUND" {
            Ok(())
        } else {
            Err(self.protocol_error("bury", &reply))
        }
    }

    /// List the tubes currently existing on the daemon.
    pub async fn list_tubes(&mut self) -> XjobResult<Vec<String>> {
        self.send_line("list-tubes").await?;
        let reply = self.read_reply_line().await?;
        let Some(len) = reply.strip_prefix("OK ") else {
            return Err(self.protocol_error("list-tubes", &reply));
        };
        let len: usize = len
            .parse()
            .map_err(|_| self.protocol_error("list-tubes", &reply))?;

        let body = self.read_body(len).await?;
        serde_yaml::from_slice(&body).map_err(|err| {
            XjobError::bus_unavailable(format!(
                "beanstalkd {}: bad list-tubes payload: {err}",
                self.addr
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;
    use tokio::net::TcpListener;

    // A scripted fake daemon: answers each received line (and put bodies)
    // with the next canned reply.
    async fn fake_daemon(replies: Vec<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(socket);
            for reply in replies {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                if line.starts_with("put ") {
                    // Consume the payload line as well.
                    let mut payload = String::new();
                    reader.read_line(&mut payload).await.unwrap();
                }
                reader
                    .get_mut()
                    .write_all(reply.as_bytes())
                    .await
                    .unwrap();
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_put_inserted() {
        let addr = fake_daemon(vec!["USING xjob\r\n", "INSERTED 42\r\n"]).await;
        let mut conn = BeanstalkConnection::connect(&addr).await.unwrap();
        conn.use_tube("xjob").await.unwrap();
        let outcome = conn.put(b"{}").await.unwrap();
        assert_eq!(outcome, PutOutcome::Inserted(42));
    }

    #[tokio::test]
    async fn test_put_draining_is_full() {
        let addr = fake_daemon(vec!["USING xjob\r\n", "DRAINING\r\n"]).await;
        let mut conn = BeanstalkConnection::connect(&addr).await.unwrap();
        conn.use_tube("xjob").await.unwrap();
        assert_eq!(conn.put(b"{}").await.unwrap(), PutOutcome::Full);
    }

    #[tokio::test]
    async fn test_reserve_timeout() {
        let addr = fake_daemon(vec![
            "WATCHING 2\r\n",
            "WATCHING 1\r\n",
            "TIMED_OUT\r\n",
        ])
        .await;
        let mut conn = BeanstalkConnection::connect(&addr).await.unwrap();
        conn.watch("xjob").await.unwrap();
        assert!(conn.reserve_with_timeout(0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reserve_returns_body() {
        let addr = fake_daemon(vec![
            "WATCHING 2\r\n",
            "WATCHING 1\r\n",
            "RESERVED 7 5\r\nhello\r\n",
        ])
        .await;
        let mut conn = BeanstalkConnection::connect(&addr).await.unwrap();
        conn.watch("xjob").await.unwrap();
        let (id, body) = conn.reserve_with_timeout(1).await.unwrap().unwrap();
        assert_eq!(id, 7);
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn test_list_tubes_parses_yaml() {
        let addr = fake_daemon(vec!["OK 26\r\n---\n- default\n- xjob-work\n\r\n"]).await;
        let mut conn = BeanstalkConnection::connect(&addr).await.unwrap();
        let tubes = conn.list_tubes().await.unwrap();
        assert_eq!(tubes, vec!["default", "xjob-work"]);
    }

    #[tokio::test]
    async fn test_unexpected_reply_is_bus_error() {
        let addr = fake_daemon(vec!["WAT\r\n"]).await;
        let mut conn = BeanstalkConnection::connect(&addr).await.unwrap();
        let result = conn.use_tube("xjob").await;
        assert!(matches!(result, Err(XjobError::BusUnavailable(_))));
    }
}
