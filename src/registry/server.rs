use crate::{errors::RegistryError, registry::Registry};
use hyper::{
    header::{HeaderValue, CONTENT_TYPE},
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use serde_json::json;
use std::{convert::Infallible, future::Future, net::SocketAddr, sync::Arc};
use tokio::task;

const API_VERSION_HEADER: &str = "Docker-Distribution-API-Version";
const API_VERSION: &str = "registry/2.0";

/// Bind the registry HTTP API to an address
///
/// Returns the address actually bound, useful when asking for port 0, along
/// with a future that serves requests until it is dropped or fails.
pub fn bind(
    addr: &SocketAddr,
    registry: Registry,
) -> Result<(SocketAddr, impl Future<Output = Result<(), RegistryError>>), RegistryError> {
    let registry = Arc::new(registry);
    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let registry = registry.clone();
                async move { Ok::<_, Infallible>(handle(registry, req).await) }
            }))
        }
    });
    let server = Server::try_bind(addr)?.serve(make_svc);
    let local_addr = server.local_addr();
    log::info!("registry listening on http://{}", local_addr);
    Ok((local_addr, async move {
        server.await.map_err(RegistryError::from)
    }))
}

/// Catalog queries the API answers
#[derive(Clone, Debug, Eq, PartialEq)]
enum Query {
    Catalog,
    Tags(String),
}

impl Query {
    fn parse(path: &str) -> Option<Query> {
        let parts: Vec<&str> = path
            .strip_prefix("/v2/")?
            .split('/')
            .filter(|part| !part.is_empty())
            .collect();
        match parts.as_slice() {
            ["_catalog"] => Some(Query::Catalog),
            [name @ .., "tags", "list"] if !name.is_empty() => Some(Query::Tags(name.join("/"))),
            _ => None,
        }
    }

    /// Reads the catalog from disk, so this runs on the blocking pool
    fn answer(&self, registry: &Registry) -> Result<Vec<u8>, RegistryError> {
        let value = match self {
            Query::Catalog => json!({ "repositories": registry.repositories()? }),
            Query::Tags(name) => json!({ "name": name, "tags": registry.tags(name)? }),
        };
        Ok(serde_json::to_vec(&value)?)
    }
}

async fn handle(registry: Arc<Registry>, req: Request<Body>) -> Response<Body> {
    log::debug!("registry request: {} {}", req.method(), req.uri().path());
    if req.method() != Method::GET {
        return status(StatusCode::NOT_FOUND);
    }
    let path = req.uri().path().to_owned();
    if path == "/v2/" || path == "/v2" {
        let mut response = status(StatusCode::OK);
        response.headers_mut().insert(
            API_VERSION_HEADER,
            HeaderValue::from_static(API_VERSION),
        );
        return response;
    }
    let query = match Query::parse(&path) {
        Some(query) => query,
        None => return status(StatusCode::NOT_FOUND),
    };
    let answer = task::spawn_blocking(move || query.answer(&registry))
        .await
        .map_err(RegistryError::from)
        .and_then(|body| body);
    match answer {
        Ok(body) => {
            let mut response = Response::new(Body::from(body));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(err) => {
            log::warn!("registry request for {} failed: {}", path, err);
            let mut response = Response::new(Body::from(err.to_string()));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

fn status(code: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = code;
    response
}
