//! Client-side PUT and GET operations.

use obex_core::protocol::{header_id, PREAMBLE_LEN};
use obex_core::wire::{encoded_len, HEADER_PREFIX_LEN, INT_HEADER_LEN};
use obex_core::{Exchange, HeaderSet, ObexError, Opcode, ResponseCode};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::client::{unexpected, ClientSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Put,
    Get,
}

/// One PUT or GET in progress. Holds the session exclusively until dropped.
pub struct Operation<'a, S> {
    session: &'a mut ClientSession<S>,
    kind: OperationKind,
    /// Headers for the next request frame.
    pending_headers: HeaderSet,
    pending_body: Vec<u8>,
    exchange: Exchange,
    code: Option<ResponseCode>,
    done: bool,
}

impl<'a, S> Operation<'a, S> {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Headers the server has sent so far (body excluded).
    pub fn received_headers(&self) -> &HeaderSet {
        self.exchange.received()
    }

    pub fn length(&self) -> Option<u32> {
        self.exchange.length()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.exchange.content_type()
    }

    /// Code of the latest reply.
    pub fn response_code(&self) -> Option<ResponseCode> {
        self.code
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Queue headers for the next request frame.
    pub fn send_headers(&mut self, headers: HeaderSet) {
        self.pending_headers.merge(headers);
    }
}

impl<'a, S: AsyncRead + AsyncWrite + Unpin> Operation<'a, S> {
    pub(crate) fn put(session: &'a mut ClientSession<S>, headers: HeaderSet) -> Self {
        Self::new(session, OperationKind::Put, headers)
    }

    pub(crate) fn get(session: &'a mut ClientSession<S>, headers: HeaderSet) -> Self {
        Self::new(session, OperationKind::Get, headers)
    }

    fn new(session: &'a mut ClientSession<S>, kind: OperationKind, mut headers: HeaderSet) -> Self {
        headers.remove(header_id::BODY);
        headers.remove(header_id::END_OF_BODY);
        Self {
            session,
            kind,
            pending_headers: headers,
            pending_body: Vec::new(),
            exchange: Exchange::new(),
            code: None,
            done: false,
        }
    }

    /// Body bytes that fit in one PUT frame next to the pending headers.
    fn chunk_capacity(&self) -> usize {
        let conn = if self.session.connection_id().is_some() {
            INT_HEADER_LEN
        } else {
            0
        };
        let overhead = PREAMBLE_LEN + conn + encoded_len(&self.pending_headers) + HEADER_PREFIX_LEN;
        (self.session.mtu() as usize).saturating_sub(overhead).max(1)
    }

    fn require(&self, kind: OperationKind, action: &'static str) -> Result<(), ObexError> {
        if self.kind != kind || self.done {
            return Err(ObexError::InvalidState {
                from: if self.done { "done" } else { "operating" },
                action,
            });
        }
        Ok(())
    }

    async fn send(&mut self, opcode: Opcode, mut headers: HeaderSet) -> Result<ResponseCode, ObexError> {
        let received = match self.session.exchange(opcode, &[], &mut headers).await {
            Ok(r) => r,
            Err(e) => {
                self.done = true;
                self.exchange.body().close();
                return Err(self.session.fail(e).await);
            }
        };
        self.code = Some(received.code);
        self.exchange.absorb(received.headers);
        Ok(received.code)
    }

    /// Buffer `data`; full frames go out as soon as they fill.
    pub async fn write(&mut self, mut data: &[u8]) -> Result<(), ObexError> {
        self.require(OperationKind::Put, "write")?;
        loop {
            let room = self.chunk_capacity();
            if self.pending_body.len() + data.len() <= room {
                self.pending_body.extend_from_slice(data);
                return Ok(());
            }
            let take = room.saturating_sub(self.pending_body.len());
            self.pending_body.extend_from_slice(&data[..take]);
            data = &data[take..];
            self.flush_chunk().await?;
        }
    }

    async fn flush_chunk(&mut self) -> Result<(), ObexError> {
        let mut headers = std::mem::take(&mut self.pending_headers);
        headers.set_body(std::mem::take(&mut self.pending_body));
        let code = self.send(Opcode::Put, headers).await?;
        if code != ResponseCode::CONTINUE {
            self.done = true;
            return Err(unexpected("0x90", code));
        }
        Ok(())
    }

    /// GET: request the next part of the body.
    pub(crate) async fn request_more(&mut self) -> Result<(), ObexError> {
        let headers = std::mem::take(&mut self.pending_headers);
        let code = self.send(Opcode::GetFinal, headers).await?;
        match code {
            ResponseCode::CONTINUE => Ok(()),
            ResponseCode::SUCCESS => {
                self.done = true;
                self.exchange.body().finish();
                Ok(())
            }
            other => {
                self.done = true;
                self.exchange.body().close();
                Err(unexpected("0x90 or 0xA0", other))
            }
        }
    }

    /// GET: read body bytes, fetching more from the server as needed. 0 means end of body.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ObexError> {
        if self.kind != OperationKind::Get {
            return Err(ObexError::InvalidState {
                from: "putting",
                action: "read",
            });
        }
        loop {
            let n = self.exchange.body().try_read(buf)?;
            if n > 0 || buf.is_empty() {
                return Ok(n);
            }
            if self.done {
                return Ok(0);
            }
            self.request_more().await?;
        }
    }

    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, ObexError> {
        let mut out = Vec::with_capacity(self.length().unwrap_or(0) as usize);
        let mut buf = vec![0u8; self.session.mtu() as usize];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Send ABORT and return the server's code as is.
    pub async fn abort(&mut self) -> Result<ResponseCode, ObexError> {
        self.done = true;
        self.exchange.body().close();
        let mut headers = HeaderSet::new();
        headers.set_end_of_body(Vec::new());
        let frame = match self.session.round_trip(Opcode::Abort, &[], &headers).await {
            Ok(f) => f,
            Err(e) => return Err(self.session.fail(e).await),
        };
        let code = frame.response_code();
        tracing::debug!(%code, "operation aborted");
        self.code = Some(code);
        Ok(code)
    }

    /// PUT: send what is left as END_OF_BODY. GET: abort unless the body already ended.
    pub async fn close(&mut self) -> Result<ResponseCode, ObexError> {
        match self.kind {
            OperationKind::Get => match (self.done, self.code) {
                (true, Some(code)) => Ok(code),
                _ => self.abort().await,
            },
            OperationKind::Put => {
                if self.done {
                    return self.code.ok_or(ObexError::ConnectionClosed);
                }
                let mut headers = std::mem::take(&mut self.pending_headers);
                headers.set_end_of_body(std::mem::take(&mut self.pending_body));
                let code = self.send(Opcode::PutFinal, headers).await?;
                self.done = true;
                if !code.is_success() {
                    return Err(unexpected("success", code));
                }
                Ok(code)
            }
        }
    }
}

impl<S> Drop for Operation<'_, S> {
    fn drop(&mut self) {
        self.session.session_state_mut().end_operation();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{pair, Peer};
    use obex_core::auth;
    use obex_core::{ClientState, HeaderValue, StaticCredentials};
    use std::sync::Arc;

    async fn connected(mtu: u16) -> (ClientSession<tokio::io::DuplexStream>, Peer) {
        let (mut client, mut peer) = pair();
        let server = tokio::spawn(async move {
            peer.accept_connect(mtu, &HeaderSet::new()).await;
            peer
        });
        client.connect(HeaderSet::new()).await.unwrap();
        (client, server.await.unwrap())
    }

    #[tokio::test]
    async fn put_chunks_against_mtu() {
        let mtu: u16 = 0x0400;
        let (mut client, mut peer) = connected(mtu).await;
        let data: Vec<u8> = (0..3 * mtu as usize).map(|i| (i % 251) as u8).collect();
        let server = tokio::spawn(async move {
            let mut frames = Vec::new();
            loop {
                let req = peer.expect().await;
                let code = req.code();
                frames.push(req);
                if code == 0x82 {
                    peer.reply(ResponseCode::SUCCESS, &HeaderSet::new()).await;
                    return frames;
                }
                peer.reply(ResponseCode::CONTINUE, &HeaderSet::new()).await;
            }
        });
        let mut op = client.put(HeaderSet::new()).unwrap();
        op.write(&data).await.unwrap();
        assert_eq!(op.close().await.unwrap(), ResponseCode::SUCCESS);
        drop(op);
        assert_eq!(client.state(), ClientState::Connected);

        let frames = server.await.unwrap();
        let n = 3 * mtu as usize;
        let chunk = mtu as usize - 6;
        assert_eq!(frames.len(), (n + chunk - 1) / chunk);
        let mut body = Vec::new();
        for f in &frames {
            assert!(f.len() <= mtu as usize);
            let hs = f.headers();
            if let Some(b) = hs.body() {
                body.extend_from_slice(b);
            }
            if let Some(b) = hs.end_of_body() {
                body.extend_from_slice(b);
            }
        }
        assert_eq!(body, data);
    }

    #[tokio::test]
    async fn put_headers_ride_first_frame() {
        let (mut client, mut peer) = connected(0x2000).await;
        let server = tokio::spawn(async move {
            let req = peer.expect().await;
            peer.reply(ResponseCode::SUCCESS, &HeaderSet::new()).await;
            req
        });
        let mut hs = HeaderSet::new();
        hs.set_name("note.txt");
        hs.set_length(5);
        let mut op = client.put(hs).unwrap();
        op.write(b"hello").await.unwrap();
        op.close().await.unwrap();
        drop(op);
        let req = server.await.unwrap();
        assert_eq!(req.code(), 0x82);
        let headers = req.headers();
        assert_eq!(headers.name(), Some("note.txt"));
        assert_eq!(headers.end_of_body(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn put_rejected_mid_stream() {
        let mtu: u16 = 0x0100;
        let (mut client, mut peer) = connected(mtu).await;
        let server = tokio::spawn(async move {
            peer.expect().await;
            peer.reply(ResponseCode::FORBIDDEN, &HeaderSet::new()).await;
            peer
        });
        let mut op = client.put(HeaderSet::new()).unwrap();
        let err = op.write(&vec![7u8; 4 * mtu as usize]).await.unwrap_err();
        assert!(matches!(err, ObexError::UnexpectedResponseCode { .. }));
        assert!(op.write(b"more").await.is_err());
        drop(op);
        let _peer = server.await.unwrap();
        assert_eq!(client.state(), ClientState::Connected);
    }

    #[tokio::test]
    async fn put_challenge_answered_by_resending_frame() {
        let mtu: u16 = 0x0400;
        let (mut client, mut peer) = connected(mtu).await;
        client.set_credentials(Arc::new(StaticCredentials::new(None, "secret")));
        let challenge = auth::build_challenge(Some("files"), false, true);
        let payload = challenge.payload.clone();
        let server = tokio::spawn(async move {
            let first = peer.expect().await;
            let mut hs = HeaderSet::new();
            hs.set(header_id::AUTH_CHALLENGE, HeaderValue::Bytes(payload))
                .unwrap();
            peer.reply(ResponseCode::UNAUTHORIZED, &hs).await;
            let retried = peer.expect().await;
            peer.reply(ResponseCode::CONTINUE, &HeaderSet::new()).await;
            let mut rest = Vec::new();
            loop {
                let req = peer.expect().await;
                let code = req.code();
                rest.push(req);
                if code == 0x82 {
                    peer.reply(ResponseCode::SUCCESS, &HeaderSet::new()).await;
                    return (first, retried, rest);
                }
                peer.reply(ResponseCode::CONTINUE, &HeaderSet::new()).await;
            }
        });
        let mut hs = HeaderSet::new();
        hs.set_name("a.bin");
        let mut op = client.put(hs).unwrap();
        op.write(&vec![5u8; 2 * mtu as usize]).await.unwrap();
        assert_eq!(op.close().await.unwrap(), ResponseCode::SUCCESS);
        drop(op);

        let (first, retried, rest) = server.await.unwrap();
        assert_eq!(first.code(), 0x02);
        assert!(first.headers().bytes(header_id::AUTH_RESPONSE).is_none());
        assert_eq!(retried.code(), 0x02);
        let headers = retried.headers();
        assert_eq!(headers.name(), Some("a.bin"));
        assert_eq!(headers.body(), first.headers().body());
        let response = headers.bytes(header_id::AUTH_RESPONSE).unwrap();
        auth::verify_response(
            response,
            Some(&challenge.nonce),
            &StaticCredentials::new(None, "secret"),
        )
        .unwrap();
        assert!(rest
            .iter()
            .all(|f| f.headers().bytes(header_id::AUTH_RESPONSE).is_none()));
        assert_eq!(client.state(), ClientState::Connected);
    }

    #[tokio::test]
    async fn get_reads_across_replies() {
        let (mut client, mut peer) = connected(0x2000).await;
        let server = tokio::spawn(async move {
            let first = peer.expect().await;
            let mut hs = HeaderSet::new();
            hs.set_length(6);
            hs.set_body(b"abc".to_vec());
            peer.reply(ResponseCode::CONTINUE, &hs).await;
            let second = peer.expect().await;
            let mut hs = HeaderSet::new();
            hs.set_end_of_body(b"def".to_vec());
            peer.reply(ResponseCode::SUCCESS, &hs).await;
            (first, second)
        });
        let mut hs = HeaderSet::new();
        hs.set_name("f.bin");
        let mut op = client.get(hs).await.unwrap();
        assert_eq!(op.length(), Some(6));
        assert_eq!(op.read_to_end().await.unwrap(), b"abcdef");
        assert_eq!(op.close().await.unwrap(), ResponseCode::SUCCESS);
        drop(op);
        let (first, second) = server.await.unwrap();
        assert_eq!(first.code(), 0x83);
        assert_eq!(first.headers().name(), Some("f.bin"));
        assert_eq!(second.code(), 0x83);
        assert!(second.headers().name().is_none());
    }

    #[tokio::test]
    async fn get_not_found() {
        let (mut client, mut peer) = connected(0x2000).await;
        let server = tokio::spawn(async move {
            peer.expect().await;
            peer.reply(ResponseCode::NOT_FOUND, &HeaderSet::new()).await;
            peer
        });
        let err = client.get(HeaderSet::new()).await.err().unwrap();
        assert!(matches!(
            err,
            ObexError::UnexpectedResponseCode {
                got: ResponseCode::NOT_FOUND,
                ..
            }
        ));
        let _peer = server.await.unwrap();
        assert_eq!(client.state(), ClientState::Connected);
    }

    #[tokio::test]
    async fn abort_mid_get() {
        let (mut client, mut peer) = connected(0x2000).await;
        let server = tokio::spawn(async move {
            peer.expect().await;
            let mut hs = HeaderSet::new();
            hs.set_body(vec![1u8; 10]);
            peer.reply(ResponseCode::CONTINUE, &hs).await;
            let abort = peer.expect().await;
            peer.reply(ResponseCode::SUCCESS, &HeaderSet::new()).await;
            abort
        });
        let mut op = client.get(HeaderSet::new()).await.unwrap();
        assert_eq!(op.abort().await.unwrap(), ResponseCode::SUCCESS);
        assert!(op.is_done());
        drop(op);
        let abort = server.await.unwrap();
        assert_eq!(abort.as_bytes(), &[0xFF, 0x00, 0x06, 0x49, 0x00, 0x03]);
        assert_eq!(client.state(), ClientState::Connected);
    }
}
