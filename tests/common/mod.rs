//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use smtp2amqp::config::AppConfig;

/// Config for one test, on fixed local ports, with probes evaluated live.
pub fn config(smtp: SocketAddr, http: SocketAddr) -> AppConfig {
    let mut config = AppConfig::default();
    config.amqp.login = "guest".into();
    config.amqp.password = "guest".into();
    config.amqp.health_interval_secs = 0;
    config.smtp.addr = smtp.to_string();
    config.smtp.login = "user".into();
    config.smtp.password = "secret".into();
    config.smtp.shutdown_timeout_ms = 500;
    config.http.addr = http.to_string();
    config.health.cache_ttl_ms = 0;
    config
}

/// Wait until something accepts connections on `addr`.
pub async fn wait_for_listener(addr: SocketAddr) {
    for _ in 0..100 {
        if TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("nothing listening on {addr}");
}

/// Minimal line-oriented SMTP client.
pub struct SmtpClient {
    stream: BufReader<TcpStream>,
}

impl SmtpClient {
    /// Connect and consume the greeting.
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = Self {
            stream: BufReader::new(stream),
        };
        assert_eq!(client.code().await, 220);
        client
    }

    pub async fn send(&mut self, line: &str) {
        let stream = self.stream.get_mut();
        stream.write_all(line.as_bytes()).await.unwrap();
        stream.write_all(b"\r\n").await.unwrap();
    }

    /// Read one full reply, multiline replies included.
    pub async fn reply(&mut self) -> String {
        let mut text = String::new();
        loop {
            let mut line = String::new();
            let n = self.stream.read_line(&mut line).await.unwrap();
            assert!(n >= 4, "connection closed mid-reply: {text:?}");
            text.push_str(&line);
            if line.as_bytes()[3] == b' ' {
                return text;
            }
        }
    }

    pub async fn code(&mut self) -> u16 {
        self.reply().await[..3].parse().unwrap()
    }

    pub async fn command(&mut self, line: &str) -> u16 {
        self.send(line).await;
        self.code().await
    }

    /// EHLO then AUTH PLAIN with the given credentials; returns the AUTH code.
    pub async fn login(&mut self, username: &str, password: &str) -> u16 {
        assert_eq!(self.command("EHLO tester").await, 250);
        use base64::Engine;
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("\0{username}\0{password}"));
        self.command(&format!("AUTH PLAIN {token}")).await
    }

    /// Submit one message; returns the code of the final DATA reply.
    pub async fn submit(&mut self, from: &str, to: &[&str], body: &str) -> u16 {
        assert_eq!(self.command(&format!("MAIL FROM:<{from}>")).await, 250);
        for rcpt in to {
            assert_eq!(self.command(&format!("RCPT TO:<{rcpt}>")).await, 250);
        }
        assert_eq!(self.command("DATA").await, 354);
        for line in body.lines() {
            self.send(line).await;
        }
        self.command(".").await
    }
}
