//! Receive-side state shared by client and server operations.

use crate::body::BodyBuffer;
use crate::headers::{HeaderSet, HeaderValue};
use crate::protocol::header_id;

/// Headers and body bytes collected over the packets of one PUT or GET.
#[derive(Debug, Default)]
pub struct Exchange {
    received: HeaderSet,
    body: BodyBuffer,
    length: Option<u32>,
    content_type: Option<String>,
    saw_body: bool,
}

impl Exchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one packet's headers in. BODY/END_OF_BODY go to the body buffer
    /// (END_OF_BODY also finishes it); the rest are merged into the received headers.
    /// Returns true when END_OF_BODY was present.
    pub fn absorb(&mut self, headers: HeaderSet) -> bool {
        let mut end = false;
        for (id, value) in headers.iter() {
            match (id, value) {
                (header_id::BODY, HeaderValue::Bytes(data)) => {
                    self.saw_body = true;
                    self.body.push(data);
                }
                (header_id::END_OF_BODY, HeaderValue::Bytes(data)) => {
                    self.saw_body = true;
                    self.body.push(data);
                    end = true;
                }
                (header_id::LENGTH, HeaderValue::Int(len)) => {
                    self.length = Some(*len);
                    self.received.insert(id, value.clone());
                }
                (header_id::TYPE, HeaderValue::Text(t)) => {
                    self.content_type = Some(t.clone());
                    self.received.insert(id, value.clone());
                }
                _ => self.received.insert(id, value.clone()),
            }
        }
        if end {
            self.body.finish();
        }
        end
    }

    pub fn received(&self) -> &HeaderSet {
        &self.received
    }

    pub fn body(&self) -> &BodyBuffer {
        &self.body
    }

    /// Most recent LENGTH header, if the peer sent one.
    pub fn length(&self) -> Option<u32> {
        self.length
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Whether any BODY or END_OF_BODY header has arrived.
    pub fn saw_body(&self) -> bool {
        self.saw_body
    }
}
