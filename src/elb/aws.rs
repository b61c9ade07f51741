use super::{ListenerDescription, LoadBalancerApi};
use crate::error::SyncError;
use crate::types::ListenerKey;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_elasticloadbalancing::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_elasticloadbalancing::types::Listener;
use aws_sdk_elasticloadbalancing::Client;
use log::info;

/// Error codes meaning our credentials will never work without operator
/// action.  Anything else is treated as transient.
const FATAL_CODES: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "AuthFailure",
    "ExpiredToken",
    "InvalidClientTokenId",
    "MissingAuthenticationToken",
    "SignatureDoesNotMatch",
    "UnrecognizedClientException",
];

pub struct AwsLoadBalancer {
    client: Client,
}

impl AwsLoadBalancer {
    /// Builds a client from the SDK's default credential chain.  An empty
    /// or missing region defers to the SDK's own region resolution.
    pub async fn from_env(region: Option<String>) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region.filter(|r| !r.is_empty()) {
            info!("Using AWS region {}", region);
            loader = loader.region(Region::new(region));
        }
        let shared = loader.load().await;
        Self {
            client: Client::new(&shared),
        }
    }
}

#[async_trait]
impl LoadBalancerApi for AwsLoadBalancer {
    async fn describe_listeners(
        &self,
        load_balancer: &str,
    ) -> Result<Vec<ListenerDescription>, SyncError> {
        let output = match self
            .client
            .describe_load_balancers()
            .load_balancer_names(load_balancer)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                let err = e.into_service_error();
                if err.is_access_point_not_found_exception() {
                    return Err(SyncError::LoadBalancerNotFound(load_balancer.to_string()));
                }
                return Err(classify(&err));
            }
        };

        let description = output
            .load_balancer_descriptions()
            .first()
            .ok_or_else(|| SyncError::LoadBalancerNotFound(load_balancer.to_string()))?;

        Ok(description
            .listener_descriptions()
            .iter()
            .filter_map(|d| d.listener())
            .map(|l| ListenerDescription {
                protocol: l.protocol().to_string(),
                load_balancer_port: l.load_balancer_port(),
                instance_protocol: l.instance_protocol().map(str::to_string),
                instance_port: l.instance_port(),
            })
            .collect())
    }

    async fn create_listener(
        &self,
        load_balancer: &str,
        key: ListenerKey,
    ) -> Result<(), SyncError> {
        let listener = tcp_listener(key)?;
        match self
            .client
            .create_load_balancer_listeners()
            .load_balancer_name(load_balancer)
            .listeners(listener)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = e.into_service_error();
                if err.is_duplicate_listener_exception() {
                    Err(SyncError::ListenerExists {
                        load_balancer: load_balancer.to_string(),
                        port: key.port,
                    })
                } else if err.is_access_point_not_found_exception() {
                    Err(SyncError::LoadBalancerNotFound(load_balancer.to_string()))
                } else {
                    Err(classify(&err))
                }
            }
        }
    }

    async fn delete_listener(&self, load_balancer: &str, port: u16) -> Result<(), SyncError> {
        match self
            .client
            .delete_load_balancer_listeners()
            .load_balancer_name(load_balancer)
            .load_balancer_ports(i32::from(port))
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = e.into_service_error();
                if err.is_access_point_not_found_exception() {
                    Err(SyncError::LoadBalancerNotFound(load_balancer.to_string()))
                } else if err.code() == Some("ListenerNotFound") {
                    Err(SyncError::ListenerNotFound {
                        load_balancer: load_balancer.to_string(),
                        port,
                    })
                } else {
                    Err(classify(&err))
                }
            }
        }
    }
}

/// TCP on `key.port`, forwarded to the same port on the instances.
fn tcp_listener(key: ListenerKey) -> Result<Listener, SyncError> {
    let port = i32::from(key.port);
    Listener::builder()
        .protocol(key.protocol.as_str())
        .load_balancer_port(port)
        .instance_protocol(key.protocol.as_str())
        .instance_port(port)
        .build()
        .map_err(|e| SyncError::Remote(e.to_string()))
}

fn classify<E>(err: &E) -> SyncError
where
    E: ProvideErrorMetadata + std::error::Error,
{
    match err.code() {
        Some(code) if FATAL_CODES.contains(&code) => SyncError::Fatal(format!(
            "{}: {}",
            code,
            err.message().unwrap_or_default()
        )),
        _ => SyncError::Remote(DisplayErrorContext(err).to_string()),
    }
}
