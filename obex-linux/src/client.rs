//! OBEX client session over a frame transport.

use std::sync::Arc;
use std::time::Duration;

use obex_core::auth::{self, Challenge};
use obex_core::protocol::header_id;
use obex_core::{
    encode_request, ClientState, ConnectParams, CredentialProvider, HeaderSet, HeaderValue,
    ObexError, Opcode, RawFrame, ResponseCode, SessionState, SetPathFlags, DEFAULT_MTU,
};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::operation::Operation;
use crate::transport::{Connector, FrameIo, Trigger};

/// Response code and headers of one request/response exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: ResponseCode,
    pub headers: HeaderSet,
}

/// A reply as read off the wire, before the caller judges its code.
pub(crate) struct Received {
    pub code: ResponseCode,
    pub params: Option<ConnectParams>,
    pub headers: HeaderSet,
}

impl Received {
    fn parse(opcode: Opcode, frame: &RawFrame) -> Result<Self, ObexError> {
        let code = frame.response_code();
        if opcode != Opcode::Connect {
            return Ok(Self {
                code,
                params: None,
                headers: frame.headers(),
            });
        }
        match frame.connect_parts() {
            Ok((params, headers)) => Ok(Self {
                code,
                params: Some(params),
                headers,
            }),
            // A refusal may come without the CONNECT parameters.
            Err(_) if !code.is_success() => Ok(Self {
                code,
                params: None,
                headers: frame.headers(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn into_reply(self) -> Reply {
        Reply {
            code: self.code,
            headers: self.headers,
        }
    }
}

pub(crate) fn unexpected(expected: &'static str, got: ResponseCode) -> ObexError {
    ObexError::UnexpectedResponseCode { expected, got }
}

pub struct ClientSession<S> {
    io: FrameIo<S>,
    state: SessionState,
    credentials: Option<Arc<dyn CredentialProvider>>,
    /// Some when the server must prove it knows the password; the realm to send.
    challenge_server: Option<Option<String>>,
}

impl<S> ClientSession<S> {
    pub fn state(&self) -> ClientState {
        self.state.state()
    }

    /// Negotiated packet size (the local one until connected).
    pub fn mtu(&self) -> u16 {
        self.state.mtu()
    }

    pub fn connection_id(&self) -> Option<u32> {
        self.state.connection_id()
    }

    /// Whether the server answered our challenge.
    pub fn is_server_authorized(&self) -> bool {
        self.state.is_authorized()
    }

    pub(crate) fn session_state_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> ClientSession<S> {
    pub fn new(stream: S) -> Self {
        Self::with_mtu(stream, DEFAULT_MTU)
    }

    /// `mtu` is the packet size offered at CONNECT.
    pub fn with_mtu(stream: S, mtu: u16) -> Self {
        Self {
            io: FrameIo::new(stream),
            state: SessionState::new(mtu),
            credentials: None,
            challenge_server: None,
        }
    }

    /// Answers server challenges (and verifies the server when `challenge_server` is set).
    pub fn set_credentials(&mut self, provider: Arc<dyn CredentialProvider>) {
        self.credentials = Some(provider);
    }

    /// Challenge the server on the next CONNECT.
    pub fn challenge_server(&mut self, realm: Option<String>) {
        self.challenge_server = Some(realm);
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.io.set_timeout(timeout);
    }

    /// Fire to abort the in-flight read with `Cancelled`; the session is closed afterwards.
    pub fn cancel_handle(&self) -> Trigger {
        self.io.cancel_handle()
    }

    /// Drop the transport without DISCONNECT.
    pub async fn close(&mut self) {
        self.io.close().await;
        self.state.close();
    }

    /// Close the session when `e` leaves the stream in an unknown state.
    pub(crate) async fn fail(&mut self, e: ObexError) -> ObexError {
        if e.is_fatal_for_session() {
            tracing::warn!(error = %e, "closing session");
            self.close().await;
        }
        e
    }

    /// One request frame out, one reply frame back.
    pub(crate) async fn round_trip(
        &mut self,
        opcode: Opcode,
        prefix: &[u8],
        headers: &HeaderSet,
    ) -> Result<RawFrame, ObexError> {
        let connection_id = match opcode {
            Opcode::Connect => None,
            _ => self.state.connection_id(),
        };
        let frame = encode_request(opcode, prefix, connection_id, headers)?;
        if frame.len() > self.state.mtu() as usize {
            tracing::debug!(len = frame.len(), mtu = self.state.mtu(), "request exceeds mtu");
        }
        self.io.send(&frame).await?;
        self.io.recv().await
    }

    /// Send a request; an AUTH_CHALLENGE in the reply is answered by sending the
    /// same request once more with AUTH_RESPONSE.
    pub(crate) async fn exchange(
        &mut self,
        opcode: Opcode,
        prefix: &[u8],
        headers: &mut HeaderSet,
    ) -> Result<Received, ObexError> {
        let frame = self.round_trip(opcode, prefix, headers).await?;
        let received = Received::parse(opcode, &frame)?;
        let Some(challenge) = received.headers.bytes(header_id::AUTH_CHALLENGE) else {
            return Ok(received);
        };
        let Some(provider) = self.credentials.clone() else {
            tracing::debug!(?opcode, "challenged without credentials");
            return Ok(received);
        };
        let response = auth::build_response(challenge, provider.as_ref())?;
        headers.set(header_id::AUTH_RESPONSE, HeaderValue::Bytes(response))?;
        let retried = self.round_trip(opcode, prefix, headers).await;
        headers.remove(header_id::AUTH_RESPONSE);
        Received::parse(opcode, &retried?)
    }

    pub async fn connect(&mut self, headers: HeaderSet) -> Result<Reply, ObexError> {
        self.state.begin_connect()?;
        match self.connect_inner(headers).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                tracing::warn!(error = %e, "connect failed");
                self.close().await;
                Err(e)
            }
        }
    }

    async fn connect_inner(&mut self, mut headers: HeaderSet) -> Result<Reply, ObexError> {
        let challenge: Option<Challenge> = match &self.challenge_server {
            Some(realm) => {
                let c = auth::build_challenge(realm.as_deref(), false, true);
                headers.set(header_id::AUTH_CHALLENGE, HeaderValue::Bytes(c.payload.clone()))?;
                Some(c)
            }
            None => None,
        };
        let local = self.state.local_mtu();
        let received = self
            .exchange(Opcode::Connect, &ConnectParams::new(local).to_bytes(), &mut headers)
            .await?;
        if received.code != ResponseCode::SUCCESS {
            return Err(unexpected("0xA0", received.code));
        }
        let params = received
            .params
            .ok_or_else(|| ObexError::MalformedFrame("CONNECT reply without parameters".into()))?;
        let mtu = params.negotiate(local)?;
        if let Some(challenge) = challenge {
            let provider = self
                .credentials
                .clone()
                .ok_or(ObexError::AuthenticationFailed)?;
            let response = received
                .headers
                .bytes(header_id::AUTH_RESPONSE)
                .ok_or(ObexError::AuthenticationFailed)?;
            auth::verify_response(response, Some(&challenge.nonce), provider.as_ref())?;
            self.state.set_authorized(true);
        }
        self.state.connected(mtu, received.headers.connection_id())?;
        tracing::info!(mtu, connection_id = ?self.state.connection_id(), "connected");
        Ok(received.into_reply())
    }

    /// DISCONNECT. The transport is closed whatever the outcome.
    pub async fn disconnect(&mut self, headers: HeaderSet) -> Result<Reply, ObexError> {
        self.state.begin_disconnect()?;
        let result = self.round_trip(Opcode::Disconnect, &[], &headers).await;
        self.close().await;
        let reply = Received::parse(Opcode::Disconnect, &result?)?.into_reply();
        if reply.code != ResponseCode::SUCCESS {
            return Err(unexpected("0xA0", reply.code));
        }
        tracing::info!("disconnected");
        Ok(reply)
    }

    pub async fn set_path(
        &mut self,
        mut headers: HeaderSet,
        backup: bool,
        create: bool,
    ) -> Result<Reply, ObexError> {
        self.state.require_connected("set path")?;
        let flags = SetPathFlags { backup, create };
        let received = match self.exchange(Opcode::SetPath, &flags.to_bytes(), &mut headers).await {
            Ok(r) => r,
            Err(e) => return Err(self.fail(e).await),
        };
        if !received.code.is_success() {
            return Err(unexpected("success", received.code));
        }
        Ok(received.into_reply())
    }

    /// PUT-final with no body headers.
    pub async fn delete(&mut self, mut headers: HeaderSet) -> Result<Reply, ObexError> {
        self.state.require_connected("delete")?;
        headers.remove(header_id::BODY);
        headers.remove(header_id::END_OF_BODY);
        let received = match self.exchange(Opcode::PutFinal, &[], &mut headers).await {
            Ok(r) => r,
            Err(e) => return Err(self.fail(e).await),
        };
        if !received.code.is_success() {
            return Err(unexpected("success", received.code));
        }
        Ok(received.into_reply())
    }

    /// Start a GET; the first request goes out before this returns.
    pub async fn get(&mut self, headers: HeaderSet) -> Result<Operation<'_, S>, ObexError> {
        self.state.begin_operation()?;
        let mut op = Operation::get(self, headers);
        op.request_more().await?;
        Ok(op)
    }

    /// Start a PUT; nothing is sent until the body is flushed or the operation closed.
    pub fn put(&mut self, headers: HeaderSet) -> Result<Operation<'_, S>, ObexError> {
        self.state.begin_operation()?;
        Ok(Operation::put(self, headers))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> ClientSession<S> {
    /// Open a stream with `connector` and wrap it in a session.
    pub async fn open<C>(connector: &C, mtu: u16) -> Result<Self, ObexError>
    where
        C: Connector<Stream = S>,
    {
        let stream = connector.connect().await?;
        Ok(Self::with_mtu(stream, mtu))
    }
}
