use super::authenticate::{handle_client_authenticate, Credential};
use crate::{
    rsip_ext::ResponseExt,
    transaction::{
        endpoint::EndpointInnerRef,
        key::{TransactionKey, TransactionRole},
        make_call_id, make_tag,
        transaction::Transaction,
    },
    Error, Result,
};
use rsip::{
    prelude::{ToTypedHeader, UntypedHeader},
    typed::Contact,
    Header, Method, Response, SipMessage, StatusCode, StatusCodeKind,
};
use tracing::{debug, info};

/// Expiry assumed when a 2xx names none.
const DEFAULT_GRANTED_EXPIRES: u32 = 50;

/// REGISTER client binding one address-of-record to our contact.
///
/// Call-ID and CSeq survive refreshes. One digest challenge is answered per
/// request. The `received`/`rport` the registrar stamps on our Via is
/// remembered and replaces the host of the contact we register, so a UA
/// behind NAT refreshes the address the registrar can reach.
pub struct Registration {
    endpoint: EndpointInnerRef,
    aor: rsip::Uri,
    contact: rsip::Uri,
    credential: Option<Credential>,
    call_id: rsip::headers::CallId,
    seq: u32,
    public_address: Option<rsip::HostWithPort>,
    granted: Option<u32>,
}

impl Registration {
    pub fn new(
        endpoint: EndpointInnerRef,
        aor: rsip::Uri,
        contact: rsip::Uri,
        credential: Option<Credential>,
    ) -> Self {
        let call_id = make_call_id(endpoint.option.callid_suffix.as_deref());
        Registration {
            endpoint,
            aor,
            contact,
            credential,
            call_id,
            seq: 0,
            public_address: None,
            granted: None,
        }
    }

    pub fn public_address(&self) -> Option<&rsip::HostWithPort> {
        self.public_address.as_ref()
    }

    /// Seconds granted by the last 2xx, or 50 when it carried no expiry.
    pub fn expires(&self) -> u32 {
        self.granted.unwrap_or(DEFAULT_GRANTED_EXPIRES)
    }

    fn contact_header(&self) -> Contact {
        let mut uri = self.contact.clone();
        if let Some(public) = &self.public_address {
            uri.host_with_port = public.clone();
        }
        Contact {
            display_name: None,
            uri,
            params: vec![],
        }
    }

    fn build_register(&mut self, server: rsip::Uri, expires: u32) -> Result<rsip::Request> {
        self.seq += 1;
        let to = rsip::typed::To {
            display_name: None,
            uri: self.aor.clone(),
            params: vec![],
        };
        let from = rsip::typed::From {
            display_name: None,
            uri: self.aor.clone(),
            params: vec![],
        }
        .with_tag(make_tag());
        let via = self.endpoint.get_via(None, None)?;
        let mut request =
            self.endpoint
                .make_request(Method::Register, server, via, from, to, self.seq);
        request.headers.unique_push(self.call_id.clone().into());
        request
            .headers
            .unique_push(Header::Contact(self.contact_header().into()));
        request
            .headers
            .unique_push(rsip::headers::Expires::from(expires).into());
        request
            .headers
            .unique_push(Header::ContentLength(Default::default()));
        Ok(request)
    }

    /// What the registrar granted: the `expires` of our binding in the
    /// Contact list, else the Expires header.
    fn granted_expires(&self, resp: &Response) -> Option<u32> {
        let ours = self.contact_header().uri;
        let from_contact = resp.headers.iter().find_map(|h| match h {
            Header::Contact(contact) => contact
                .typed()
                .ok()
                .filter(|c| c.uri.host_with_port == ours.host_with_port)
                .and_then(|c| c.expires().and_then(|e| e.seconds().ok())),
            _ => None,
        });
        from_contact.or_else(|| {
            resp.headers.iter().find_map(|h| match h {
                Header::Expires(e) => e.value().trim().parse::<u32>().ok(),
                _ => None,
            })
        })
    }

    fn learn_public_address(&mut self, resp: &Response) {
        let received = resp.via_received();
        if received.is_some() && self.public_address != received {
            info!(
                aor = %self.aor,
                "registrar sees us at {:?}, was {:?}",
                received, self.public_address
            );
            self.public_address = received;
        }
    }

    /// Send one REGISTER for `expires` seconds and return the final
    /// response. Non-2xx finals are returned, not turned into errors.
    pub async fn register(&mut self, server: rsip::Uri, expires: u32) -> Result<Response> {
        let request = self.build_register(server, expires)?;
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request, self.endpoint.clone(), None);
        tx.send().await?;

        let mut challenged = false;
        while let Some(msg) = tx.receive().await? {
            let SipMessage::Response(resp) = msg else {
                continue;
            };
            match &resp.status_code {
                StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired => {
                    self.learn_public_address(&resp);
                    let credential = match &self.credential {
                        Some(credential) if !challenged => credential,
                        _ => {
                            debug!(aor = %self.aor, challenged, "giving up on {}", resp.status_code);
                            return Ok(resp);
                        }
                    };
                    self.seq += 1;
                    tx = handle_client_authenticate(self.seq, &tx, resp, credential)?;
                    tx.send().await?;
                    challenged = true;
                }
                code if code.kind() == StatusCodeKind::Provisional => continue,
                code if code.kind() == StatusCodeKind::Successful => {
                    self.learn_public_address(&resp);
                    self.granted = if expires == 0 {
                        Some(0)
                    } else {
                        self.granted_expires(&resp)
                    };
                    info!(aor = %self.aor, expires = self.expires(), "REGISTER {}", code);
                    return Ok(resp);
                }
                code => {
                    info!(aor = %self.aor, "REGISTER refused: {}", code);
                    return Ok(resp);
                }
            }
        }
        Err(Error::RegistrationError(format!(
            "REGISTER for {} ended without a final response",
            self.aor
        )))
    }

    /// Remove our binding: REGISTER with Expires 0.
    pub async fn unregister(&mut self, server: rsip::Uri) -> Result<Response> {
        self.register(server, 0).await
    }
}
