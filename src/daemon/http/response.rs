use bytes::Bytes;
use http_body_util::{Either, Empty, Full};
use hyper::StatusCode;
use hyper::header::{CONTENT_TYPE, WWW_AUTHENTICATE};
use log::{debug, error};
use serde::Serialize;
use crate::commons::error::Error;
use crate::constants::{HTTP_HEADER_ARCHIVE_ID, HTTP_HEADER_REQUEST_ID};
use crate::server::request::SignatureResponse;


//----------- ContentType ----------------------------------------------------

#[derive(Clone, Copy)]
enum ContentType {
    Json,
    Text,
}

impl ContentType {
    fn as_str(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Text => "text/plain",
        }
    }
}


//------------ HyperResponse -------------------------------------------------

pub type HyperResponseBody = Either<Empty<Bytes>, Full<Bytes>>;
pub type HyperResponse = hyper::Response<HyperResponseBody>;


//----------- Response -------------------------------------------------------

struct Response {
    status: StatusCode,
    content_type: String,
    headers: Vec<(&'static str, String)>,
    body: Bytes,
}

impl Response {
    fn new(status: StatusCode) -> Self {
        Response {
            status,
            content_type: ContentType::Text.as_str().into(),
            headers: Vec::new(),
            body: Bytes::default(),
        }
    }

    fn finalize(self) -> HttpResponse {
        let mut builder = hyper::Response::builder()
            .status(self.status)
            .header(CONTENT_TYPE, self.content_type);

        if self.status == StatusCode::UNAUTHORIZED {
            builder = builder.header(
                WWW_AUTHENTICATE, "Basic realm=\"SignServer\""
            );
        }
        for (name, value) in self.headers {
            builder = builder.header(name, value);
        }

        let body = if self.body.is_empty() {
            Either::Left(Empty::new())
        }
        else {
            Either::Right(Full::new(self.body))
        };
        match builder.body(body) {
            Ok(response) => HttpResponse(response),
            Err(err) => {
                // Only happens with header values that are not ASCII.
                error!("Cannot build HTTP response: {err}");
                let mut response = hyper::Response::new(
                    Either::Left(Empty::new())
                );
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                HttpResponse(response)
            }
        }
    }
}


//------------ HttpResponse --------------------------------------------------

#[derive(Debug)]
pub struct HttpResponse(HyperResponse);

impl HttpResponse {
    pub fn into_hyper(self) -> HyperResponse {
        self.0
    }

    pub fn status(&self) -> StatusCode {
        self.0.status()
    }

    /// Returns the response for a processed request.
    pub fn processed(response: &SignatureResponse) -> Self {
        Response {
            status: StatusCode::OK,
            content_type: response.content_type().into(),
            headers: vec![
                (HTTP_HEADER_ARCHIVE_ID, response.archive_id().to_string()),
                (HTTP_HEADER_REQUEST_ID, response.request_id().to_string()),
            ],
            body: response.data().clone(),
        }.finalize()
    }

    pub fn json<O: Serialize>(object: &O) -> Self {
        match serde_json::to_string(object) {
            Ok(json) => Response {
                status: StatusCode::OK,
                content_type: ContentType::Json.as_str().into(),
                headers: Vec::new(),
                body: json.into(),
            }.finalize(),
            Err(err) => Self::response_from_error(
                Error::signserver(format!("Cannot encode JSON: {err}"))
            ),
        }
    }

    pub fn text(body: impl Into<Bytes>) -> Self {
        Self::text_with_status(StatusCode::OK, body)
    }

    pub fn text_with_status(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Response {
            status,
            content_type: ContentType::Text.as_str().into(),
            headers: Vec::new(),
            body: body.into(),
        }.finalize()
    }

    pub fn response_from_error(error: Error) -> Self {
        let status = error.status();
        if status.is_server_error() {
            error!("{error}");
        }
        else {
            debug!("{error}");
        }
        Self::text_with_status(status, error.message().into_owned())
    }

    pub fn not_found() -> Self {
        Response::new(StatusCode::NOT_FOUND).finalize()
    }

    pub fn method_not_allowed() -> Self {
        Response::new(StatusCode::METHOD_NOT_ALLOWED).finalize()
    }

    pub fn payload_too_large() -> Self {
        Response::new(StatusCode::PAYLOAD_TOO_LARGE).finalize()
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processed_response_headers() {
        let response = SignatureResponse::new(
            17, Bytes::from_static(b"reply"),
            crate::server::signers::timestamp::RESPONSE_CONTENT_TYPE, "arch-1"
        );
        let http = HttpResponse::processed(&response).into_hyper();
        assert_eq!(http.status(), StatusCode::OK);
        assert_eq!(
            http.headers()[CONTENT_TYPE], "application/timestamp-reply"
        );
        assert_eq!(http.headers()[HTTP_HEADER_ARCHIVE_ID], "arch-1");
        assert_eq!(http.headers()[HTTP_HEADER_REQUEST_ID], "17");
    }

    #[test]
    fn error_responses() {
        let http = HttpResponse::response_from_error(
            Error::AuthorizationRequired("Missing credentials".into())
        ).into_hyper();
        assert_eq!(http.status(), StatusCode::UNAUTHORIZED);
        assert!(http.headers().contains_key(WWW_AUTHENTICATE));

        let http = HttpResponse::response_from_error(
            Error::offline("Crypto token is offline")
        );
        assert_eq!(http.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
