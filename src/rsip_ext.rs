use crate::transport::{SipAddr, SipConnection};
use crate::{Error, Result};
use nom::{
    branch::alt,
    bytes::complete::{is_not, take_until},
    character::complete::{char, multispace0},
    combinator::opt,
    sequence::{delimited, preceded},
    IResult, Parser,
};
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};

pub trait ResponseExt {
    /// Our address as the server saw it, from `received`/`rport` of the
    /// top Via.
    fn via_received(&self) -> Option<rsip::HostWithPort>;
    /// Remote target announced in the Contact header.
    fn contact_uri(&self) -> Result<rsip::Uri>;
}

impl ResponseExt for rsip::Response {
    fn via_received(&self) -> Option<rsip::HostWithPort> {
        let via = self.via_header().ok()?;
        SipConnection::parse_target_from_via(via).ok()
    }

    fn contact_uri(&self) -> Result<rsip::Uri> {
        let contact = self.contact_header()?;
        match contact.typed() {
            Ok(typed) => Ok(typed.uri),
            Err(_) => parse_name_addr(contact.value()),
        }
    }
}

fn quoted_name(input: &str) -> IResult<&str, &str> {
    delimited(char('"'), take_until("\""), char('"')).parse(input)
}

/// `"Display" <sip:uri;uri-params>;header-params`
fn bracketed(input: &str) -> IResult<&str, &str> {
    let (input, _) = opt(alt((quoted_name, is_not("<\"")))).parse(input)?;
    let (input, _) = multispace0(input)?;
    delimited(char('<'), is_not(">"), char('>')).parse(input)
}

/// `sip:uri;header-params`: without brackets every parameter belongs to
/// the header, not the URI.
fn bare(input: &str) -> IResult<&str, &str> {
    is_not(";,").parse(input)
}

fn name_addr(input: &str) -> IResult<&str, &str> {
    preceded(multispace0, alt((bracketed, bare))).parse(input)
}

/// URI of a Contact, Refer-To or similar name-addr value that rsip's typed
/// headers could not parse.
pub fn parse_name_addr(value: &str) -> Result<rsip::Uri> {
    let (_, uri) = name_addr(value.trim())
        .map_err(|e| Error::SipMessageError(format!("bad name-addr {:?}: {}", value, e)))?;
    let mut uri = rsip::Uri::try_from(uri.trim())?;
    uri.headers.clear();
    Ok(uri)
}

/// Next hop of a request with a pre-existing route set: the first Route.
pub fn route_destination(request: &rsip::Request) -> Option<SipAddr> {
    request.headers.iter().find_map(|header| match header {
        rsip::Header::Route(route) => route
            .typed()
            .ok()
            .and_then(|r| r.uris().first().and_then(|u| SipAddr::try_from(&u.uri).ok())),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_name_addr() -> Result<()> {
        let uri = parse_name_addr("\"Bob\" <sip:bob@10.0.0.2:5062;transport=tcp>;expires=60")?;
        assert_eq!(uri.host_with_port.to_string(), "10.0.0.2:5062");
        assert!(uri
            .params
            .iter()
            .any(|p| matches!(p, rsip::Param::Transport(rsip::Transport::Tcp))));

        let uri = parse_name_addr("Carol <sip:carol@10.0.0.3>")?;
        assert_eq!(uri.to_string(), "sip:carol@10.0.0.3");

        // header params are not URI params
        let uri = parse_name_addr("sip:alice@10.0.0.1;expires=60")?;
        assert_eq!(uri.to_string(), "sip:alice@10.0.0.1");

        assert!(parse_name_addr("   ").is_err());
        Ok(())
    }

    #[test]
    fn test_route_destination() {
        let mut request = rsip::Request {
            method: rsip::Method::Bye,
            uri: rsip::Uri::try_from("sip:bob@10.0.0.2:5062").expect("uri"),
            headers: Default::default(),
            version: rsip::Version::V2,
            body: vec![],
        };
        assert!(route_destination(&request).is_none());
        request
            .headers
            .push(rsip::headers::Route::new("<sip:10.0.0.9:5070;lr>").into());
        let destination = route_destination(&request).expect("route");
        assert_eq!(destination.addr.to_string(), "10.0.0.9:5070");
    }
}
