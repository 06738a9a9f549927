//! Protocol message dispatcher.
//!
//! A [`Wire`] owns the transport and runs one request/response exchange at a
//! time. Every request ends in `Sync` (or is a simple `Query`), so the server
//! answers each with exactly one `ReadyForQuery`; the number still owed is
//! tracked in `pending_syncs`. A caller that gives up halfway (its future was
//! dropped, or it returned early on an error) leaves that count above zero and
//! the next request first drains the stale responses, which keeps the stream
//! aligned without reading anything eagerly.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::auth::{md5_password, ScramSha256, SCRAM_SHA_256};
use super::buffer::split_frame;
use super::config::Config;
use super::error::{PgError, PgResult, ServerError};
use super::protocol::*;
use super::row::{Column, Row};
use super::statement::StatementState;
use super::types::{Oid, Param};

/// Byte stream the protocol runs over.
pub trait Socket: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Socket for T {}

/// Server parameters reported through `ParameterStatus`.
pub(crate) type ServerParameters = Arc<RwLock<HashMap<String, String>>>;

/// Result of `Parse` + `Describe`.
#[derive(Debug, Clone, Default)]
pub(crate) struct Description {
    pub params: Vec<Oid>,
    pub columns: Vec<Column>,
}

/// Backend identity from `BackendKeyData`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BackendKey {
    pub process_id: i32,
}

pub(crate) struct Wire {
    stream: Box<dyn Socket>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    status: TransactionStatus,
    parameters: ServerParameters,
    /// `ReadyForQuery` messages the server still owes us.
    pending_syncs: usize,
    /// Statement names to close ahead of the next request.
    close_queue: Vec<String>,
    /// Set when the byte stream can no longer be framed.
    poisoned: bool,
    /// Reverts a guarded transaction or savepoint that is still open.
    pending_undo: Option<String>,
}

impl Wire {
    /// Run the startup handshake over `stream`.
    pub(crate) async fn startup(
        stream: Box<dyn Socket>,
        config: &Config,
        parameters: ServerParameters,
    ) -> PgResult<(Self, BackendKey)> {
        let mut wire = Self {
            stream,
            read_buf: BytesMut::with_capacity(32 * 1024),
            write_buf: BytesMut::with_capacity(8 * 1024),
            status: TransactionStatus::Idle,
            parameters,
            pending_syncs: 0,
            close_queue: Vec::new(),
            poisoned: false,
            pending_undo: None,
        };

        let mut options = vec![("client_encoding", "UTF8")];
        if let Some(name) = &config.application_name {
            options.push(("application_name", name.as_str()));
        }
        StartupMessage {
            user: &config.user,
            database: Some(&config.database),
            options,
        }
        .encode(&mut wire.write_buf);
        wire.flush().await?;

        let mut key = BackendKey::default();
        let mut scram: Option<ScramSha256> = None;

        loop {
            match wire.receive().await? {
                BackendMessage::AuthenticationOk => {
                    trace!(user = %config.user, "authenticated");
                }
                BackendMessage::AuthenticationCleartextPassword => {
                    let password = require_password(config)?;
                    PasswordMessage { password }.encode(&mut wire.write_buf);
                    wire.flush().await?;
                }
                BackendMessage::AuthenticationMD5Password { salt } => {
                    let password = md5_password(&config.user, require_password(config)?, &salt);
                    PasswordMessage {
                        password: &password,
                    }
                    .encode(&mut wire.write_buf);
                    wire.flush().await?;
                }
                BackendMessage::AuthenticationSASL { mechanisms } => {
                    if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                        return Err(PgError::Auth(format!(
                            "server requires unsupported SASL mechanisms: {:?}",
                            mechanisms
                        )));
                    }
                    let client = ScramSha256::new(&config.user, require_password(config)?);
                    SaslInitialResponseMessage {
                        mechanism: SCRAM_SHA_256,
                        data: &client.client_first(),
                    }
                    .encode(&mut wire.write_buf);
                    wire.flush().await?;
                    scram = Some(client);
                }
                BackendMessage::AuthenticationSASLContinue { data } => {
                    let client = scram.as_mut().ok_or_else(|| {
                        PgError::Protocol("SASL continue without SASL start".to_string())
                    })?;
                    let client_final = client.client_final(&data)?;
                    SaslResponseMessage {
                        data: &client_final,
                    }
                    .encode(&mut wire.write_buf);
                    wire.flush().await?;
                }
                BackendMessage::AuthenticationSASLFinal { data } => {
                    let client = scram.as_ref().ok_or_else(|| {
                        PgError::Protocol("SASL final without SASL start".to_string())
                    })?;
                    client.verify(&data)?;
                }
                BackendMessage::BackendKeyData { process_id, .. } => {
                    key = BackendKey { process_id };
                }
                BackendMessage::ReadyForQuery { .. } => return Ok((wire, key)),
                BackendMessage::ErrorResponse { fields } => {
                    return Err(ServerError::from_fields(fields).into());
                }
                other => return Err(unexpected(&other)),
            }
        }
    }

    pub(crate) fn transaction_status(&self) -> TransactionStatus {
        self.status
    }

    pub(crate) fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Close these statements ahead of the next request.
    pub(crate) fn queue_closes(&mut self, names: Vec<String>) {
        self.close_queue.extend(names);
    }

    /// Parse and describe `query` as the named statement.
    pub(crate) async fn prepare(&mut self, name: &str, query: &str) -> PgResult<Description> {
        self.begin_request().await?;

        ParseMessage {
            name,
            query,
            param_types: &[],
        }
        .encode(&mut self.write_buf);
        DescribeMessage {
            target: Target::Statement,
            name,
        }
        .encode(&mut self.write_buf);
        self.sync().await?;

        let mut description = Description::default();
        loop {
            match self.receive().await? {
                BackendMessage::ParseComplete | BackendMessage::NoData => {}
                BackendMessage::ParameterDescription { type_oids } => {
                    description.params = type_oids;
                }
                BackendMessage::RowDescription { fields } => {
                    description.columns = fields;
                }
                BackendMessage::ReadyForQuery { .. } if self.pending_syncs == 0 => {
                    return Ok(description);
                }
                msg => self.expect_ignorable(msg)?,
            }
        }
    }

    /// Bind and execute a prepared statement.
    ///
    /// `max_rows` of 0 fetches everything, otherwise the portal is suspended
    /// after that many rows and the remainder discarded at `Sync`.
    pub(crate) async fn execute(
        &mut self,
        stmt: &StatementState,
        params: &[Param],
        max_rows: i32,
    ) -> PgResult<Vec<Row>> {
        self.begin_request().await?;

        BindMessage {
            portal: "",
            statement: &stmt.name,
            params,
            result_formats: &stmt.result_formats,
        }
        .encode(&mut self.write_buf);
        ExecuteMessage {
            portal: "",
            max_rows,
        }
        .encode(&mut self.write_buf);
        self.sync().await?;

        let mut rows = Vec::new();
        loop {
            match self.receive().await? {
                BackendMessage::BindComplete
                | BackendMessage::CommandComplete { .. }
                | BackendMessage::EmptyQueryResponse
                | BackendMessage::PortalSuspended => {}
                BackendMessage::DataRow { values } => {
                    rows.push(stmt.decode_row(values)?);
                }
                BackendMessage::ReadyForQuery { .. } if self.pending_syncs == 0 => {
                    return Ok(rows);
                }
                msg => self.expect_ignorable(msg)?,
            }
        }
    }

    /// Run `sql` with the simple query protocol and return the last command tag.
    ///
    /// Result rows are discarded.
    pub(crate) async fn simple_query(&mut self, sql: &str) -> PgResult<String> {
        self.begin_request().await?;
        self.send_query(sql).await?;
        self.query_result().await
    }

    /// Run `begin` (a `BEGIN` or `SAVEPOINT`) and arm `undo` to revert it.
    ///
    /// The undo runs at [`end_guarded`](Self::end_guarded), or ahead of the
    /// next exchange if the caller never gets there.
    pub(crate) async fn begin_guarded(&mut self, begin: &str, undo: &str) -> PgResult<()> {
        self.begin_request().await?;

        // Armed as soon as `begin` is queued
        QueryMessage { query: begin }.encode(&mut self.write_buf);
        self.pending_syncs += 1;
        self.pending_undo = Some(undo.to_string());
        self.flush().await?;

        if let Err(err) = self.query_result().await {
            self.pending_undo = None;
            return Err(err);
        }
        Ok(())
    }

    /// Run an armed undo, if any, once stale responses are drained.
    pub(crate) async fn end_guarded(&mut self) -> PgResult<()> {
        self.settle().await?;

        let Some(undo) = self.pending_undo.take() else {
            return Ok(());
        };
        trace!(%undo, "reverting guarded block");
        self.send_query(&undo).await?;
        self.query_result().await.map(|_| ())
    }

    async fn send_query(&mut self, sql: &str) -> PgResult<()> {
        QueryMessage { query: sql }.encode(&mut self.write_buf);
        self.pending_syncs += 1;
        self.flush().await
    }

    /// Responses to a simple `Query`, up to its `ReadyForQuery`.
    async fn query_result(&mut self) -> PgResult<String> {
        let mut last_tag = String::new();
        loop {
            match self.receive().await? {
                BackendMessage::RowDescription { .. }
                | BackendMessage::DataRow { .. }
                | BackendMessage::EmptyQueryResponse => {}
                BackendMessage::CommandComplete { tag } => last_tag = tag,
                BackendMessage::ReadyForQuery { .. } if self.pending_syncs == 0 => {
                    return Ok(last_tag);
                }
                msg => self.expect_ignorable(msg)?,
            }
        }
    }

    /// Best-effort farewell: close `names`, send `Terminate` and shut the
    /// stream down without waiting for any reply.
    pub(crate) async fn goodbye(mut self, names: Vec<String>) -> PgResult<()> {
        self.close_queue.extend(names);
        if !self.close_queue.is_empty() {
            debug!(count = self.close_queue.len(), "closing statements before terminate");
            for name in &self.close_queue {
                CloseMessage {
                    target: Target::Statement,
                    name,
                }
                .encode(&mut self.write_buf);
            }
            SyncMessage.encode(&mut self.write_buf);
        }
        TerminateMessage.encode(&mut self.write_buf);
        self.flush().await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    // ========================================================================
    // Private helpers
    // ========================================================================

    /// Bring the stream back to a clean state and pipeline queued closes.
    async fn begin_request(&mut self) -> PgResult<()> {
        self.settle().await?;

        if !self.close_queue.is_empty() {
            trace!(count = self.close_queue.len(), "closing statements");
            for name in self.close_queue.drain(..) {
                CloseMessage {
                    target: Target::Statement,
                    name: &name,
                }
                .encode(&mut self.write_buf);
            }
            SyncMessage.encode(&mut self.write_buf);
            self.pending_syncs += 1;
        }

        Ok(())
    }

    /// Finish writing and reading whatever an abandoned request left behind.
    ///
    /// Undecodable stale messages are skipped; they belong to a request
    /// whose caller already gave up or got its error.
    async fn settle(&mut self) -> PgResult<()> {
        if !self.write_buf.is_empty() {
            self.flush().await?;
        }

        if self.pending_syncs > 0 {
            trace!(pending = self.pending_syncs, "draining stale responses");
            while self.pending_syncs > 0 {
                match self.receive().await {
                    Ok(_) => {}
                    Err(PgError::Protocol(err)) if !self.poisoned => {
                        debug!(error = %err, "skipping malformed stale message");
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }

    /// Terminate the current request with `Sync` and send it.
    async fn sync(&mut self) -> PgResult<()> {
        SyncMessage.encode(&mut self.write_buf);
        self.pending_syncs += 1;
        self.flush().await
    }

    /// Write out the buffer. Progress is kept in the buffer itself, so an
    /// interrupted flush can be resumed.
    async fn flush(&mut self) -> PgResult<()> {
        self.stream.write_all_buf(&mut self.write_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receive the next message that concerns the current request.
    ///
    /// `ParameterStatus`, notices and notifications are handled here and never
    /// returned.
    async fn receive(&mut self) -> PgResult<BackendMessage> {
        loop {
            let frame = match split_frame(&mut self.read_buf) {
                Ok(frame) => frame,
                Err(err) => {
                    self.poisoned = true;
                    return Err(err);
                }
            };

            let Some((tag, body)) = frame else {
                let n = self.stream.read_buf(&mut self.read_buf).await?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "server closed the connection",
                    )
                    .into());
                }
                continue;
            };

            match BackendMessage::decode(tag, body)? {
                BackendMessage::ParameterStatus { name, value } => {
                    trace!(%name, %value, "server parameter");
                    self.parameters.write().insert(name, value);
                }
                BackendMessage::NoticeResponse { fields } => {
                    let notice = ServerError::from_fields(fields);
                    debug!(
                        severity = %notice.severity,
                        code = %notice.code,
                        message = %notice.message,
                        "server notice"
                    );
                }
                BackendMessage::NotificationResponse {
                    process_id,
                    channel,
                    ..
                } => {
                    debug!(process_id, %channel, "discarding notification");
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.status = status;
                    self.pending_syncs = self.pending_syncs.saturating_sub(1);
                    return Ok(BackendMessage::ReadyForQuery { status });
                }
                msg => return Ok(msg),
            }
        }
    }

    /// Accept responses left over from pipelined closes, fail on errors and
    /// anything else.
    fn expect_ignorable(&self, msg: BackendMessage) -> PgResult<()> {
        match msg {
            // An earlier batch in this request completing
            BackendMessage::CloseComplete | BackendMessage::ReadyForQuery { .. } => Ok(()),
            BackendMessage::ErrorResponse { fields } => {
                Err(ServerError::from_fields(fields).into())
            }
            other => Err(unexpected(&other)),
        }
    }
}

fn require_password(config: &Config) -> PgResult<&str> {
    config
        .password
        .as_deref()
        .ok_or_else(|| PgError::Auth("password required".to_string()))
}

fn unexpected(msg: &BackendMessage) -> PgError {
    PgError::Protocol(format!("unexpected {} message", msg.name()))
}
