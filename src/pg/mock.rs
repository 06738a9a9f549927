//! Scripted in-process backend for tests.
//!
//! Speaks enough of the v3 protocol over a `tokio::io::duplex` pipe to drive a
//! [`Connection`](super::Connection) through startup, the extended query
//! cycle, simple queries and shutdown. Queries are answered from registered
//! [`MockStatement`]s; anything unregistered parses fine and returns no rows.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

use super::auth::md5_password;
use super::buffer::{put_cstr, split_frame, write_message, ReadBuffer};
use super::config::Config;
use super::connection::Connection;
use super::types::{Format, Oid, Value};

pub(crate) const BACKEND_PID: i32 = 4242;
pub(crate) const SERVER_VERSION: &str = "16.4";

/// How the server answers `Execute` (or a simple query) for a statement.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Rows(Vec<Vec<Value>>),
    /// One row holding the bound parameters.
    Echo,
    /// `ErrorResponse` at parse time.
    ParseError(&'static str, String),
    /// `ErrorResponse` at execute time.
    Fail(&'static str, String),
    /// Rows after a pause.
    Delayed(Duration, Vec<Vec<Value>>),
    /// Never answer again.
    Hang,
    /// Drop the connection.
    Disconnect,
    /// Two `DataRow`s whose bodies are cut short, then a normal completion.
    Malformed,
}

#[derive(Debug, Clone)]
pub(crate) struct MockStatement {
    params: Vec<Oid>,
    columns: Vec<(String, Oid)>,
    reply: Reply,
}

impl MockStatement {
    pub(crate) fn new(reply: Reply) -> Self {
        Self {
            params: Vec::new(),
            columns: Vec::new(),
            reply,
        }
    }

    pub(crate) fn params(mut self, params: &[Oid]) -> Self {
        self.params = params.to_vec();
        self
    }

    pub(crate) fn column(mut self, name: &str, oid: Oid) -> Self {
        self.columns.push((name.to_string(), oid));
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) enum MockAuth {
    Trust,
    Cleartext(String),
    Md5(String),
}

/// What the server saw.
#[derive(Debug, Default)]
pub(crate) struct MockStats {
    /// Query text of every `Parse`
    pub parses: Vec<String>,
    /// Statement names of every `Close`
    pub closes: Vec<String>,
    /// Number of `Execute` messages
    pub executes: usize,
    /// Text of every simple `Query`
    pub simple: Vec<String>,
    /// `Terminate` received
    pub terminated: bool,
}

pub(crate) struct MockServer {
    statements: HashMap<String, MockStatement>,
    auth: MockAuth,
}

pub(crate) struct MockHandle {
    stats: Arc<Mutex<MockStats>>,
    task: JoinHandle<()>,
}

impl MockHandle {
    pub(crate) fn stats(&self) -> parking_lot::MutexGuard<'_, MockStats> {
        self.stats.lock()
    }

    /// Wait for the server side to hang up.
    pub(crate) async fn finished(self) -> Arc<Mutex<MockStats>> {
        let _ = self.task.await;
        self.stats
    }
}

impl MockServer {
    pub(crate) fn new() -> Self {
        Self {
            statements: HashMap::new(),
            auth: MockAuth::Trust,
        }
    }

    pub(crate) fn auth(mut self, auth: MockAuth) -> Self {
        self.auth = auth;
        self
    }

    pub(crate) fn statement(mut self, query: &str, statement: MockStatement) -> Self {
        self.statements.insert(query.to_string(), statement);
        self
    }

    /// Start serving and return the client end of the pipe.
    pub(crate) fn start(self) -> (DuplexStream, MockHandle) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let stats = Arc::new(Mutex::new(MockStats::default()));
        let session = Session {
            stream: server,
            buf: BytesMut::new(),
            out: BytesMut::new(),
            statements: self.statements,
            auth: self.auth,
            prepared: HashMap::new(),
            portal: None,
            status: b'I',
            failed: false,
            stats: Arc::clone(&stats),
        };
        let task = tokio::spawn(session.run());
        (client, MockHandle { stats, task })
    }

    /// Start serving and connect a client to it.
    pub(crate) async fn connect(self, config: Config) -> (Connection, MockHandle) {
        let (client, handle) = self.start();
        let conn = Connection::connect_stream(client, config)
            .await
            .expect("mock handshake");
        (conn, handle)
    }
}

struct Portal {
    query: String,
    params: Vec<(Format, Option<Bytes>)>,
    result_formats: Vec<Format>,
}

struct Session {
    stream: DuplexStream,
    buf: BytesMut,
    out: BytesMut,
    statements: HashMap<String, MockStatement>,
    auth: MockAuth,
    /// Statement name → query text
    prepared: HashMap<String, String>,
    portal: Option<Portal>,
    status: u8,
    /// Skipping to the next `Sync` after an error
    failed: bool,
    stats: Arc<Mutex<MockStats>>,
}

enum Flow {
    Continue,
    Hang,
    Stop,
}

impl Session {
    async fn run(mut self) {
        if !self.startup().await {
            return;
        }

        let mut hanging = false;
        while let Some((tag, body)) = self.next_frame().await {
            if hanging {
                if tag == b'X' {
                    self.stats.lock().terminated = true;
                    return;
                }
                continue;
            }

            match self.handle(tag, body).await {
                Flow::Continue => {}
                Flow::Hang => hanging = true,
                Flow::Stop => return,
            }
            // Frames sent before the client hung up still count
            if self.send().await.is_err() {
                self.out.clear();
            }
        }
    }

    async fn startup(&mut self) -> bool {
        // Untagged: length word then body
        while self.buf.len() < 4
            || self.buf.len() < u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize
        {
            match self.stream.read_buf(&mut self.buf).await {
                Ok(0) | Err(_) => return false,
                Ok(_) => {}
            }
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        let mut body = ReadBuffer::new(self.buf.split_to(len).freeze().slice(4..));
        let _version = body.read_i32();
        let mut user = String::new();
        while let Ok(key) = body.read_cstr() {
            if key.is_empty() {
                break;
            }
            let value = body.read_cstr().unwrap_or_default();
            if key == "user" {
                user = value;
            }
        }

        let salt = [7u8, 1, 3, 9];
        let expected = match &self.auth {
            MockAuth::Trust => None,
            MockAuth::Cleartext(password) => {
                write_message(&mut self.out, b'R', |b| b.put_i32(3));
                Some(password.clone())
            }
            MockAuth::Md5(password) => {
                write_message(&mut self.out, b'R', |b| {
                    b.put_i32(5);
                    b.put_slice(&salt);
                });
                Some(md5_password(&user, password, &salt))
            }
        };

        if let Some(expected) = expected {
            if self.send().await.is_err() {
                return false;
            }
            let Some((b'p', body)) = self.next_frame().await else {
                return false;
            };
            let given = ReadBuffer::new(body).read_cstr().unwrap_or_default();
            if given != expected {
                error(&mut self.out, "28P01", "password authentication failed");
                let _ = self.send().await;
                return false;
            }
        }

        write_message(&mut self.out, b'R', |b| b.put_i32(0));
        for (name, value) in [("server_version", SERVER_VERSION), ("client_encoding", "UTF8")] {
            write_message(&mut self.out, b'S', |b| {
                put_cstr(b, name);
                put_cstr(b, value);
            });
        }
        write_message(&mut self.out, b'K', |b| {
            b.put_i32(BACKEND_PID);
            b.put_i32(99);
        });
        self.ready();
        self.send().await.is_ok()
    }

    async fn handle(&mut self, tag: u8, body: Bytes) -> Flow {
        let mut body = ReadBuffer::new(body);

        match tag {
            b'S' => {
                self.failed = false;
                self.portal = None;
                self.ready();
                return Flow::Continue;
            }
            b'X' => {
                self.stats.lock().terminated = true;
                return Flow::Stop;
            }
            b'Q' => {
                let sql = body.read_cstr().unwrap_or_default();
                self.failed = false;
                self.simple_query(&sql);
                return Flow::Continue;
            }
            _ if self.failed => return Flow::Continue,
            _ => {}
        }

        match tag {
            b'P' => {
                let name = body.read_cstr().unwrap_or_default();
                let query = body.read_cstr().unwrap_or_default();
                self.stats.lock().parses.push(query.clone());

                if let Reply::ParseError(code, message) = &self.script(&query).reply {
                    let (code, message) = (*code, message.clone());
                    self.fail(code, &message);
                } else if !name.is_empty() && self.prepared.contains_key(&name) {
                    self.fail("42P05", &format!("prepared statement \"{}\" already exists", name));
                } else {
                    self.prepared.insert(name, query);
                    write_message(&mut self.out, b'1', |_| {});
                }
            }
            b'D' => {
                let _kind = body.read_u8();
                let name = body.read_cstr().unwrap_or_default();
                let Some(query) = self.prepared.get(&name).cloned() else {
                    self.fail("26000", &format!("prepared statement \"{}\" does not exist", name));
                    return Flow::Continue;
                };
                let script = self.script(&query);
                write_message(&mut self.out, b't', |b| {
                    b.put_i16(script.params.len() as i16);
                    for oid in &script.params {
                        b.put_u32(oid.0);
                    }
                });
                if script.columns.is_empty() {
                    write_message(&mut self.out, b'n', |_| {});
                } else {
                    write_message(&mut self.out, b'T', |b| {
                        b.put_i16(script.columns.len() as i16);
                        for (name, oid) in &script.columns {
                            put_cstr(b, name);
                            b.put_u32(0);
                            b.put_i16(0);
                            b.put_u32(oid.0);
                            b.put_i16(-1);
                            b.put_i32(-1);
                            b.put_i16(0);
                        }
                    });
                }
            }
            b'B' => {
                let _portal = body.read_cstr();
                let name = body.read_cstr().unwrap_or_default();
                let Some(query) = self.prepared.get(&name).cloned() else {
                    self.fail("26000", &format!("prepared statement \"{}\" does not exist", name));
                    return Flow::Continue;
                };
                let Ok(portal) = read_bind(&mut body, query) else {
                    self.fail("08P01", "malformed Bind");
                    return Flow::Continue;
                };
                self.portal = Some(portal);
                write_message(&mut self.out, b'2', |_| {});
            }
            b'E' => {
                let _portal = body.read_cstr();
                let max_rows = body.read_i32().unwrap_or(0);
                self.stats.lock().executes += 1;
                return self.execute(max_rows).await;
            }
            b'C' => {
                let _kind = body.read_u8();
                let name = body.read_cstr().unwrap_or_default();
                self.prepared.remove(&name);
                self.stats.lock().closes.push(name);
                write_message(&mut self.out, b'3', |_| {});
            }
            _ => {
                self.fail("08P01", &format!("unexpected message '{}'", tag as char));
            }
        }
        Flow::Continue
    }

    async fn execute(&mut self, max_rows: i32) -> Flow {
        let Some(portal) = self.portal.take() else {
            self.fail("34000", "portal \"\" does not exist");
            return Flow::Continue;
        };
        let script = self.script(&portal.query);
        let format_of = |i: usize| match portal.result_formats.as_slice() {
            [] => Format::Text,
            [one] => *one,
            many => many.get(i).copied().unwrap_or(Format::Text),
        };

        let rows = match script.reply {
            Reply::Rows(rows) => rows,
            Reply::Delayed(pause, rows) => {
                tokio::time::sleep(pause).await;
                rows
            }
            Reply::Echo => {
                let row: Vec<Value> = portal
                    .params
                    .iter()
                    .zip(&script.params)
                    .map(|((format, data), oid)| match data {
                        Some(data) => Value::decode(*oid, *format, data).unwrap_or(Value::Null),
                        None => Value::Null,
                    })
                    .collect();
                vec![row]
            }
            Reply::Fail(code, message) => {
                self.fail(code, &message);
                return Flow::Continue;
            }
            Reply::ParseError(..) => Vec::new(),
            Reply::Hang => return Flow::Hang,
            Reply::Disconnect => return Flow::Stop,
            Reply::Malformed => {
                for _ in 0..2 {
                    write_message(&mut self.out, b'D', |b| {
                        b.put_i16(1);
                        b.put_i16(0);
                    });
                }
                write_message(&mut self.out, b'C', |b| put_cstr(b, "SELECT 1"));
                return Flow::Continue;
            }
        };

        let limit = if max_rows > 0 { max_rows as usize } else { usize::MAX };
        for row in rows.iter().take(limit) {
            write_message(&mut self.out, b'D', |b| {
                b.put_i16(row.len() as i16);
                for (i, value) in row.iter().enumerate() {
                    let oid = script.columns.get(i).map_or(Oid::TEXT, |(_, oid)| *oid);
                    match encode_value(value, oid, format_of(i)) {
                        Some(data) => {
                            b.put_i32(data.len() as i32);
                            b.put_slice(&data);
                        }
                        None => b.put_i32(-1),
                    }
                }
            });
        }
        if rows.len() > limit {
            write_message(&mut self.out, b's', |_| {});
        } else {
            let tag = format!("SELECT {}", rows.len());
            write_message(&mut self.out, b'C', |b| put_cstr(b, &tag));
        }
        Flow::Continue
    }

    fn simple_query(&mut self, sql: &str) {
        self.stats.lock().simple.push(sql.to_string());

        if let Reply::Fail(code, message) = self.script(sql).reply {
            self.fail(code, &message);
        } else {
            for command in sql.split(';').map(str::trim).filter(|c| !c.is_empty()) {
                let upper = command.to_ascii_uppercase();
                if upper == "BEGIN" {
                    self.status = b'T';
                } else if (upper.starts_with("ROLLBACK") && !upper.starts_with("ROLLBACK TO"))
                    || upper.starts_with("COMMIT")
                {
                    self.status = b'I';
                }
                let tag = upper.split_whitespace().next().unwrap_or_default().to_string();
                write_message(&mut self.out, b'C', |b| put_cstr(b, &tag));
            }
        }
        self.failed = false;
        self.ready();
    }

    fn script(&self, query: &str) -> MockStatement {
        self.statements
            .get(query)
            .cloned()
            .unwrap_or_else(|| MockStatement::new(Reply::Rows(Vec::new())))
    }

    fn fail(&mut self, code: &str, message: &str) {
        error(&mut self.out, code, message);
        self.failed = true;
        if self.status == b'T' {
            self.status = b'E';
        }
    }

    fn ready(&mut self) {
        let status = self.status;
        write_message(&mut self.out, b'Z', |b| b.put_u8(status));
    }

    async fn send(&mut self) -> std::io::Result<()> {
        if self.out.is_empty() {
            return Ok(());
        }
        self.stream.write_all_buf(&mut self.out).await?;
        self.stream.flush().await
    }

    async fn next_frame(&mut self) -> Option<(u8, Bytes)> {
        loop {
            match split_frame(&mut self.buf) {
                Ok(Some(frame)) => return Some(frame),
                Ok(None) => {}
                Err(_) => return None,
            }
            match self.stream.read_buf(&mut self.buf).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }
}

fn read_bind(body: &mut ReadBuffer, query: String) -> Result<Portal, super::error::PgError> {
    let formats: Vec<Format> = (0..body.read_count()?)
        .map(|_| body.read_i16().and_then(Format::from_code))
        .collect::<Result<_, _>>()?;
    let count = body.read_count()?;
    let mut params = Vec::with_capacity(count);
    for i in 0..count {
        let format = match formats.as_slice() {
            [] => Format::Text,
            [one] => *one,
            many => many[i],
        };
        params.push((format, body.read_nullable()?));
    }
    let result_formats = (0..body.read_count()?)
        .map(|_| body.read_i16().and_then(Format::from_code))
        .collect::<Result<_, _>>()?;

    Ok(Portal {
        query,
        params,
        result_formats,
    })
}

fn encode_value(value: &Value, oid: Oid, format: Format) -> Option<Vec<u8>> {
    if value.is_null() {
        return None;
    }
    let binary = match format {
        Format::Binary => value.encode_binary(oid).ok().flatten(),
        Format::Text => None,
    };
    Some(binary.unwrap_or_else(|| value.to_text().into_bytes()))
}

fn error(out: &mut BytesMut, code: &str, message: &str) {
    write_message(out, b'E', |b| {
        for (field, value) in [(b'S', "ERROR"), (b'V', "ERROR"), (b'C', code), (b'M', message)] {
            b.put_u8(field);
            put_cstr(b, value);
        }
        b.put_u8(0);
    });
}
