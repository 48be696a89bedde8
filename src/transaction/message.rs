use super::{endpoint::EndpointInner, make_call_id, make_via_branch};
use crate::{rsip_ext::ResponseExt, transport::SipAddr, Error, Result};
use rsip::{
    headers::{ContentLength, Route},
    prelude::{ToTypedHeader, UntypedHeader},
    Header, Request, Response, StatusCode,
};

impl EndpointInner {
    /// Build an out-of-dialog request with a fresh Call-ID. Dialogs replace
    /// the Call-ID and add Contact/Route as needed.
    pub fn make_request(
        &self,
        method: rsip::Method,
        req_uri: rsip::Uri,
        via: rsip::typed::Via,
        from: rsip::typed::From,
        to: rsip::typed::To,
        seq: u32,
    ) -> Request {
        let headers = vec![
            Header::Via(via.into()),
            Header::CallId(make_call_id(self.option.callid_suffix.as_deref())),
            Header::From(from.into()),
            Header::To(to.into()),
            Header::CSeq(rsip::typed::CSeq { seq, method }.into()),
            Header::MaxForwards(70.into()),
            Header::UserAgent(self.user_agent.clone().into()),
        ];
        Request {
            method,
            uri: req_uri,
            headers: headers.into(),
            body: vec![],
            version: rsip::Version::V2,
        }
    }

    /// Response that mirrors Via, Call-ID, From, To and CSeq of `req`.
    pub fn make_response(
        &self,
        req: &Request,
        status_code: StatusCode,
        body: Option<Vec<u8>>,
    ) -> Response {
        let mut headers = req.headers.clone();
        headers.retain(|h| {
            matches!(
                h,
                Header::Via(_)
                    | Header::CallId(_)
                    | Header::From(_)
                    | Header::To(_)
                    | Header::CSeq(_)
                    | Header::RecordRoute(_)
            )
        });
        headers.push(Header::ContentLength(
            body.as_ref().map_or(0u32, |b| b.len() as u32).into(),
        ));
        headers.unique_push(Header::Server(self.user_agent.clone().into()));
        Response {
            status_code,
            version: rsip::Version::V2,
            headers,
            body: body.unwrap_or_default(),
        }
    }

    /// ACK for a final response to an INVITE. A 2xx ACK is a new
    /// transaction: it gets a fresh branch and goes to the Contact of the
    /// response along the Record-Route set. A non-2xx ACK reuses the
    /// INVITE's branch and Request-URI.
    pub fn make_ack(&self, mut uri: rsip::Uri, resp: &Response) -> Result<Request> {
        let mut headers = resp.headers.clone();
        let is_success = resp.status_code.kind() == rsip::StatusCodeKind::Successful;
        if is_success {
            for header in headers.iter_mut() {
                if let Header::Via(via) = header {
                    let mut typed_via = via.typed()?;
                    typed_via.params.retain(|p| !matches!(p, rsip::Param::Branch(_)));
                    typed_via.params.push(make_via_branch());
                    *via = typed_via.into();
                    break;
                }
            }
            uri = resp.contact_uri()?;
            let mut route_set = resp
                .headers
                .iter()
                .filter_map(|h| match h {
                    Header::RecordRoute(rr) => Some(Header::Route(Route::from(rr.value()))),
                    _ => None,
                })
                .collect::<Vec<_>>();
            route_set.reverse();
            headers.extend(route_set);
        }

        headers.retain(|h| {
            matches!(
                h,
                Header::Via(_)
                    | Header::CallId(_)
                    | Header::From(_)
                    | Header::To(_)
                    | Header::CSeq(_)
                    | Header::Route(_)
            )
        });
        // only the top Via belongs to us
        let mut seen_via = false;
        headers.retain(|h| match h {
            Header::Via(_) if seen_via => false,
            Header::Via(_) => {
                seen_via = true;
                true
            }
            _ => true,
        });
        headers.push(Header::MaxForwards(70.into()));
        for header in headers.iter_mut() {
            if let Header::CSeq(cseq) = header {
                cseq.mut_method(rsip::Method::Ack)?;
            }
        }
        headers.push(Header::ContentLength(ContentLength::default()));
        headers.unique_push(Header::UserAgent(self.user_agent.clone().into()));
        Ok(Request {
            method: rsip::Method::Ack,
            uri,
            headers,
            body: vec![],
            version: rsip::Version::V2,
        })
    }

    /// Via for a new request, sent-by the given address or the first bound
    /// transport. The transaction rewrites sent-by to the transport it uses.
    pub fn get_via(
        &self,
        addr: Option<SipAddr>,
        branch: Option<rsip::Param>,
    ) -> Result<rsip::typed::Via> {
        let addr = match addr {
            Some(addr) => addr,
            None => self
                .transport_layer
                .get_addrs()
                .first()
                .cloned()
                .ok_or(Error::Error("no transport bound".to_string()))?,
        };
        Ok(rsip::typed::Via {
            version: rsip::Version::V2,
            transport: addr.r#type.clone().unwrap_or(rsip::transport::Transport::Udp),
            uri: rsip::Uri {
                host_with_port: addr.addr,
                ..Default::default()
            },
            params: vec![
                branch.unwrap_or_else(make_via_branch),
                rsip::Param::Other(rsip::param::OtherParam::new("rport"), None),
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::transaction::{
        endpoint::EndpointBuilder, key::TransactionKey, key::TransactionRole,
    };
    use rsip::{headers::*, prelude::HeadersExt, Method};

    fn invite() -> rsip::Request {
        rsip::Request {
            method: Method::Invite,
            uri: rsip::Uri::try_from("sip:bob@127.0.0.1:5060").expect("uri"),
            headers: vec![
                Via::new("SIP/2.0/UDP 127.0.0.1:5070;branch=z9hG4bKinvite1").into(),
                CSeq::new("1 INVITE").into(),
                From::new("<sip:alice@127.0.0.1>;tag=alice1").into(),
                To::new("<sip:bob@127.0.0.1>").into(),
                CallId::new("call-1").into(),
                Contact::new("<sip:alice@127.0.0.1:5070>").into(),
            ]
            .into(),
            version: rsip::Version::V2,
            body: Default::default(),
        }
    }

    #[test]
    fn test_make_ack_for_failure_keeps_branch() -> crate::Result<()> {
        let endpoint = EndpointBuilder::new().build();
        let req = invite();
        let resp = endpoint
            .inner
            .make_response(&req, rsip::StatusCode::BusyHere, None);
        let ack = endpoint.inner.make_ack(req.uri.clone(), &resp)?;
        assert_eq!(ack.method, Method::Ack);
        assert_eq!(ack.uri, req.uri);
        assert_eq!(
            TransactionKey::from_request(&ack, TransactionRole::Client)?,
            TransactionKey::from_request(&req, TransactionRole::Client)?
        );
        assert_eq!(ack.cseq_header()?.method()?, Method::Ack);
        Ok(())
    }

    #[test]
    fn test_make_ack_for_success_uses_contact_and_new_branch() -> crate::Result<()> {
        let endpoint = EndpointBuilder::new().build();
        let req = invite();
        let mut resp = endpoint
            .inner
            .make_response(&req, rsip::StatusCode::OK, None);
        resp.headers
            .push(Contact::new("<sip:bob@127.0.0.1:5090>").into());
        let ack = endpoint.inner.make_ack(req.uri.clone(), &resp)?;
        assert_eq!(ack.uri.to_string(), "sip:bob@127.0.0.1:5090");
        assert_ne!(
            TransactionKey::from_request(&ack, TransactionRole::Client)?,
            TransactionKey::from_request(&req, TransactionRole::Client)?
        );
        Ok(())
    }
}
