//! Server side: per-connection dispatcher and TCP accept loop.

use std::sync::Arc;
use std::time::Duration;

use obex_core::auth::{self, Challenge};
use obex_core::protocol::{header_id, PREAMBLE_LEN};
use obex_core::wire::{encoded_len, HEADER_PREFIX_LEN};
use obex_core::{
    encode_response, BodyBuffer, ConnectParams, CredentialProvider, Exchange, HeaderSet,
    HeaderValue, ObexError, Opcode, RawFrame, ResponseCode, DEFAULT_MTU,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use crate::transport::{FrameIo, Trigger};

/// Largest PUT body a connection may buffer unless configured otherwise.
pub const DEFAULT_MAX_OBJECT_SIZE: u64 = 64 * 1024 * 1024;

/// Application callbacks. Unimplemented requests answer 0xD1.
pub trait RequestHandler: Send {
    fn on_connect(&mut self, _request: &HeaderSet, _response: &mut HeaderSet) -> ResponseCode {
        ResponseCode::SUCCESS
    }

    fn on_disconnect(&mut self, _request: &HeaderSet, _response: &mut HeaderSet) {}

    /// Called once the whole body has arrived.
    fn on_put(&mut self, _op: &mut ServerOperation) -> ResponseCode {
        ResponseCode::NOT_IMPLEMENTED
    }

    /// Called once per GET; write the whole body into `op`.
    fn on_get(&mut self, _op: &mut ServerOperation) -> ResponseCode {
        ResponseCode::NOT_IMPLEMENTED
    }

    fn on_set_path(
        &mut self,
        _request: &HeaderSet,
        _response: &mut HeaderSet,
        _backup: bool,
        _create: bool,
    ) -> ResponseCode {
        ResponseCode::NOT_IMPLEMENTED
    }

    fn on_authentication_failure(&mut self, _user: Option<&[u8]>) {}
}

/// Server-side view of one PUT or GET.
#[derive(Debug, Default)]
pub struct ServerOperation {
    exchange: Exchange,
    response: HeaderSet,
    outgoing: BodyBuffer,
}

impl ServerOperation {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn absorb(&mut self, headers: HeaderSet) {
        self.exchange.absorb(headers);
    }

    pub fn received_headers(&self) -> &HeaderSet {
        self.exchange.received()
    }

    pub fn name(&self) -> Option<&str> {
        self.exchange.received().name()
    }

    pub fn length(&self) -> Option<u32> {
        self.exchange.length()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.exchange.content_type()
    }

    /// A PUT that carried no BODY or END_OF_BODY header.
    pub fn is_delete(&self) -> bool {
        !self.exchange.saw_body()
    }

    /// PUT body received so far.
    pub fn take_body(&self) -> Result<Vec<u8>, ObexError> {
        self.exchange.body().drain()
    }

    /// Read the PUT body, waiting for more bytes until it finishes. 0 means end of body.
    pub fn read(&self, out: &mut [u8]) -> Result<usize, ObexError> {
        self.exchange.body().read_blocking(out, None)
    }

    fn buffered(&self) -> usize {
        self.exchange.body().available()
    }

    /// Headers for the reply (sent with the first GET reply, or the final PUT reply).
    pub fn response_headers(&mut self) -> &mut HeaderSet {
        &mut self.response
    }

    /// GET: append to the body sent back to the client.
    pub fn write(&mut self, data: &[u8]) {
        self.outgoing.push(data);
    }

    fn next_chunk(&self, max: usize) -> Result<Vec<u8>, ObexError> {
        let mut chunk = vec![0u8; max.min(self.outgoing.available())];
        let n = self.outgoing.try_read(&mut chunk)?;
        chunk.truncate(n);
        Ok(chunk)
    }

    fn release(&self) {
        self.exchange.body().close();
        self.outgoing.close();
    }

    #[cfg(test)]
    pub(crate) fn outgoing_bytes(&self) -> Vec<u8> {
        self.outgoing.drain().unwrap_or_default()
    }
}

/// Settings shared by every connection of a listener.
#[derive(Clone)]
pub struct ServerOptions {
    pub mtu: u16,
    pub credentials: Option<Arc<dyn CredentialProvider>>,
    pub require_auth: bool,
    pub realm: Option<String>,
    /// Idle read timeout per connection.
    pub timeout: Option<Duration>,
    /// PUT bodies beyond this many bytes are refused with 0xCD.
    pub max_object_size: u64,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            credentials: None,
            require_auth: false,
            realm: None,
            timeout: None,
            max_object_size: DEFAULT_MAX_OBJECT_SIZE,
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

/// Receive loop for one connection.
pub struct ServerSession<S, H> {
    io: FrameIo<S>,
    handler: H,
    options: Arc<ServerOptions>,
    peer: String,
    mtu: u16,
    authorized: bool,
    challenge: Option<Challenge>,
    put_op: Option<ServerOperation>,
    get_op: Option<ServerOperation>,
}

impl<S: AsyncRead + AsyncWrite + Unpin, H: RequestHandler> ServerSession<S, H> {
    pub fn new(stream: S, handler: H, options: Arc<ServerOptions>) -> Self {
        let mut io = FrameIo::new(stream);
        io.set_timeout(options.timeout);
        Self {
            io,
            handler,
            mtu: options.mtu,
            options,
            peer: String::from("-"),
            authorized: false,
            challenge: None,
            put_op: None,
            get_op: None,
        }
    }

    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = peer.into();
        self
    }

    /// Firing this ends the loop with `ConnectionClosed`.
    pub fn close_handle(&self) -> Trigger {
        self.io.close_handle()
    }

    /// Serve requests until DISCONNECT, EOF, a transport error or a malformed frame.
    pub async fn run(mut self) -> Result<(), ObexError> {
        tracing::info!(peer = %self.peer, "session started");
        let result = loop {
            let frame = match self.io.recv().await {
                Ok(frame) => frame,
                Err(e) => break Err(e),
            };
            match self.dispatch(frame).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.release_operations();
        self.io.close().await;
        tracing::info!(peer = %self.peer, "session ended");
        result
    }

    fn release_operations(&mut self) {
        if let Some(op) = self.put_op.take() {
            op.release();
        }
        if let Some(op) = self.get_op.take() {
            op.release();
        }
    }

    async fn reply(
        &mut self,
        code: ResponseCode,
        prefix: &[u8],
        headers: &HeaderSet,
    ) -> Result<Flow, ObexError> {
        let frame = encode_response(code, prefix, headers)?;
        self.io.send(&frame).await?;
        Ok(Flow::Continue)
    }

    async fn dispatch(&mut self, frame: RawFrame) -> Result<Flow, ObexError> {
        let Some(opcode) = frame.opcode() else {
            tracing::warn!(peer = %self.peer, code = frame.code(), "unknown opcode");
            return self
                .reply(ResponseCode::NOT_IMPLEMENTED, &[], &HeaderSet::new())
                .await;
        };
        tracing::debug!(peer = %self.peer, ?opcode, len = frame.len(), "request");
        match opcode {
            Opcode::Connect => self.on_connect(&frame).await,
            Opcode::Disconnect => self.on_disconnect(&frame).await,
            Opcode::Put | Opcode::PutFinal => self.on_put(opcode, &frame).await,
            Opcode::Get | Opcode::GetFinal => self.on_get(&frame).await,
            Opcode::SetPath => self.on_set_path(&frame).await,
            Opcode::Abort => {
                self.release_operations();
                self.reply(ResponseCode::SUCCESS, &[], &HeaderSet::new())
                    .await
            }
            Opcode::Session => {
                tracing::warn!(peer = %self.peer, "reliable sessions not supported");
                self.reply(ResponseCode::NOT_IMPLEMENTED, &[], &HeaderSet::new())
                    .await
            }
        }
    }

    /// Answer a peer challenge and enforce our own. Returns false when the
    /// request must be refused with 0xC1; `response` then carries a fresh challenge.
    fn authorize(&mut self, request: &HeaderSet, response: &mut HeaderSet) -> Result<bool, ObexError> {
        if let Some(challenge) = request.bytes(header_id::AUTH_CHALLENGE) {
            match &self.options.credentials {
                Some(provider) => match auth::build_response(challenge, provider.as_ref()) {
                    Ok(payload) => {
                        response.set(header_id::AUTH_RESPONSE, HeaderValue::Bytes(payload))?
                    }
                    Err(e) => tracing::warn!(peer = %self.peer, error = %e, "cannot answer peer challenge"),
                },
                None => tracing::debug!(peer = %self.peer, "peer challenge ignored, no credentials"),
            }
        }
        if !self.options.require_auth || self.authorized {
            return Ok(true);
        }
        if let Some(payload) = request.bytes(header_id::AUTH_RESPONSE) {
            if self.verify(payload) {
                self.authorized = true;
                return Ok(true);
            }
        }
        let challenge = auth::build_challenge(self.options.realm.as_deref(), false, true);
        response.set(
            header_id::AUTH_CHALLENGE,
            HeaderValue::Bytes(challenge.payload.clone()),
        )?;
        self.challenge = Some(challenge);
        Ok(false)
    }

    fn verify(&mut self, payload: &[u8]) -> bool {
        let result = match (&self.options.credentials, &self.challenge) {
            (Some(provider), Some(challenge)) => {
                auth::verify_response(payload, Some(&challenge.nonce), provider.as_ref())
            }
            _ => Err(ObexError::AuthenticationFailed),
        };
        match result {
            Ok(_) => {
                tracing::info!(peer = %self.peer, "peer authenticated");
                self.challenge = None;
                true
            }
            Err(e) => {
                tracing::warn!(peer = %self.peer, error = %e, "authentication failed");
                let user = auth::parse_response(payload).ok().and_then(|r| r.user);
                self.handler.on_authentication_failure(user.as_deref());
                false
            }
        }
    }

    async fn on_connect(&mut self, frame: &RawFrame) -> Result<Flow, ObexError> {
        let (params, request) = frame.connect_parts()?;
        self.mtu = params.negotiate(self.options.mtu)?;
        let mut response = HeaderSet::new();
        let code = if self.authorize(&request, &mut response)? {
            self.handler.on_connect(&request, &mut response)
        } else {
            ResponseCode::UNAUTHORIZED
        };
        tracing::info!(peer = %self.peer, mtu = self.mtu, %code, "connect");
        let prefix = ConnectParams::new(self.options.mtu).to_bytes();
        self.reply(code, &prefix, &response).await
    }

    async fn on_disconnect(&mut self, frame: &RawFrame) -> Result<Flow, ObexError> {
        let request = frame.headers();
        let mut response = HeaderSet::new();
        self.handler.on_disconnect(&request, &mut response);
        self.reply(ResponseCode::SUCCESS, &[], &response).await?;
        Ok(Flow::Stop)
    }

    async fn on_put(&mut self, opcode: Opcode, frame: &RawFrame) -> Result<Flow, ObexError> {
        let request = frame.headers();
        let mut response = HeaderSet::new();
        if let Some(op) = self.get_op.take() {
            op.release();
        }
        if self.put_op.is_none() && !self.authorize(&request, &mut response)? {
            return self.reply(ResponseCode::UNAUTHORIZED, &[], &response).await;
        }
        let mut op = self.put_op.take().unwrap_or_default();
        let incoming = request.body().map_or(0, <[u8]>::len)
            + request.end_of_body().map_or(0, <[u8]>::len);
        let buffered = (op.buffered() + incoming) as u64;
        let declared = request.length().or(op.length()).map_or(0, u64::from);
        let limit = self.options.max_object_size;
        if buffered > limit || declared > limit {
            tracing::warn!(peer = %self.peer, buffered, declared, limit, "object too large");
            op.release();
            return self
                .reply(ResponseCode::REQUEST_ENTITY_TOO_LARGE, &[], &response)
                .await;
        }
        op.absorb(request);
        if opcode == Opcode::Put {
            self.put_op = Some(op);
            return self.reply(ResponseCode::CONTINUE, &[], &response).await;
        }
        op.exchange.body().finish();
        let code = self.handler.on_put(&mut op);
        response.merge(std::mem::take(&mut op.response));
        response.remove(header_id::BODY);
        response.remove(header_id::END_OF_BODY);
        op.release();
        self.reply(code, &[], &response).await
    }

    async fn on_get(&mut self, frame: &RawFrame) -> Result<Flow, ObexError> {
        let request = frame.headers();
        if let Some(op) = self.put_op.take() {
            op.release();
        }
        let (op, mut response) = match self.get_op.take() {
            Some(mut op) => {
                op.absorb(request);
                (op, HeaderSet::new())
            }
            None => {
                let mut response = HeaderSet::new();
                if !self.authorize(&request, &mut response)? {
                    return self.reply(ResponseCode::UNAUTHORIZED, &[], &response).await;
                }
                let mut op = ServerOperation::new();
                op.absorb(request);
                let code = self.handler.on_get(&mut op);
                response.merge(std::mem::take(&mut op.response));
                if code != ResponseCode::SUCCESS && code != ResponseCode::CONTINUE {
                    op.release();
                    response.remove(header_id::BODY);
                    response.remove(header_id::END_OF_BODY);
                    return self.reply(code, &[], &response).await;
                }
                (op, response)
            }
        };
        response.remove(header_id::BODY);
        response.remove(header_id::END_OF_BODY);
        let overhead = PREAMBLE_LEN + encoded_len(&response) + HEADER_PREFIX_LEN;
        let room = (self.mtu as usize).saturating_sub(overhead);
        let chunk = op.next_chunk(room)?;
        if op.outgoing.available() == 0 {
            response.set_end_of_body(chunk);
            op.release();
            self.reply(ResponseCode::SUCCESS, &[], &response).await
        } else {
            response.set_body(chunk);
            self.get_op = Some(op);
            self.reply(ResponseCode::CONTINUE, &[], &response).await
        }
    }

    async fn on_set_path(&mut self, frame: &RawFrame) -> Result<Flow, ObexError> {
        let (flags, request) = frame.setpath_parts()?;
        let mut response = HeaderSet::new();
        let code = if self.authorize(&request, &mut response)? {
            self.handler
                .on_set_path(&request, &mut response, flags.backup, flags.create)
        } else {
            ResponseCode::UNAUTHORIZED
        };
        self.reply(code, &[], &response).await
    }
}

/// Accept connections until `shutdown` fires; one task per connection,
/// each with a fresh handler from `factory`.
pub async fn serve<F, H>(
    listener: TcpListener,
    options: Arc<ServerOptions>,
    factory: F,
    shutdown: Trigger,
) -> std::io::Result<()>
where
    F: Fn() -> H + Send + 'static,
    H: RequestHandler + 'static,
{
    tracing::info!(addr = ?listener.local_addr().ok(), "listening");
    loop {
        tokio::select! {
            _ = shutdown.fired() => {
                tracing::info!("listener stopped");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(error = %e, "set_nodelay failed");
                }
                let session = ServerSession::new(stream, factory(), options.clone())
                    .with_peer(addr.to_string());
                tokio::spawn(async move {
                    match session.run().await {
                        Ok(()) | Err(ObexError::ConnectionClosed) => {}
                        Err(e) => tracing::warn!(peer = %addr, error = %e, "session failed"),
                    }
                });
            }
        }
    }
}
