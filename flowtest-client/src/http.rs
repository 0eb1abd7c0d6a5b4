//! HTTP implementation of [`EngineClient`] against the engine's REST
//! gateway (v2 API) plus its management API (clock endpoints).

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::EngineError;
use crate::types::*;
use crate::{EngineClient, Result};

/// Credential strategy applied to every gateway/management request.
#[derive(Clone, Debug, Default)]
pub enum Auth {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    Bearer {
        token: String,
    },
}

pub struct HttpEngineClient {
    http: reqwest::Client,
    gateway: Url,
    management: Url,
    auth: Auth,
}

impl HttpEngineClient {
    pub fn new(gateway: Url, management: Url, auth: Auth) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            gateway,
            management,
            auth,
        })
    }

    pub fn gateway_url(&self) -> &Url {
        &self.gateway
    }

    fn gateway_request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self
            .gateway
            .join(path)
            .map_err(|e| EngineError::InvalidRequest(format!("bad gateway path {path}: {e}")))?;
        Ok(self.authorize(self.http.request(method, url)))
    }

    fn management_request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self
            .management
            .join(path)
            .map_err(|e| EngineError::InvalidRequest(format!("bad management path {path}: {e}")))?;
        Ok(self.authorize(self.http.request(method, url)))
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Auth::None => builder,
            Auth::Basic { username, password } => builder.basic_auth(username, Some(password)),
            Auth::Bearer { token } => builder.bearer_auth(token),
        }
    }

    /// Send, mapping 404 to [`EngineError::NotFound`] and other non-2xx
    /// statuses to [`EngineError::Engine`] with the problem-detail body.
    async fn send(
        &self,
        builder: RequestBuilder,
        entity: &'static str,
        key: &str,
    ) -> Result<reqwest::Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(EngineError::not_found(entity, key));
        }
        let message = response.text().await.unwrap_or_default();
        Err(EngineError::Engine {
            status: status.as_u16(),
            message,
        })
    }

    async fn decode<R: DeserializeOwned>(
        response: reqwest::Response,
        endpoint: &'static str,
    ) -> Result<R> {
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|source| EngineError::Decode { endpoint, source })
    }

    async fn post_search<F: Serialize + Send, R: DeserializeOwned>(
        &self,
        path: &str,
        endpoint: &'static str,
        req: SearchRequest<F>,
    ) -> Result<SearchPage<R>> {
        let builder = self.gateway_request(Method::POST, path)?.json(&req);
        let response = self.send(builder, endpoint, "search").await?;
        Self::decode(response, endpoint).await
    }
}

#[async_trait]
impl EngineClient for HttpEngineClient {
    async fn deploy(&self, resources: Vec<DeployResource>) -> Result<DeploymentResult> {
        debug!(resources = resources.len(), "deploying artifacts");
        let builder = self
            .gateway_request(Method::POST, "v2/deployments")?
            .json(&json!({ "resources": resources }));
        let response = self.send(builder, "deployment", "-").await?;
        Self::decode(response, "deployments").await
    }

    async fn delete_resource(&self, resource_key: ResourceKey) -> Result<()> {
        let path = format!("v2/resources/{resource_key}/deletion");
        let builder = self.gateway_request(Method::POST, &path)?;
        self.send(builder, "resource", &resource_key.to_string())
            .await?;
        Ok(())
    }

    async fn create_instance(&self, req: CreateInstanceRequest) -> Result<CreateInstanceResult> {
        let id = req.process_definition_id.clone();
        let builder = self
            .gateway_request(Method::POST, "v2/process-instances")?
            .json(&req);
        let response = self.send(builder, "process definition", &id).await?;
        Self::decode(response, "process-instances").await
    }

    async fn cancel_instance(&self, key: InstanceKey) -> Result<()> {
        let path = format!("v2/process-instances/{key}/cancellation");
        let builder = self.gateway_request(Method::POST, &path)?;
        self.send(builder, "process instance", &key.to_string())
            .await?;
        Ok(())
    }

    async fn get_process_instance(&self, key: InstanceKey) -> Result<ProcessInstanceResult> {
        let path = format!("v2/process-instances/{key}");
        let builder = self.gateway_request(Method::GET, &path)?;
        let response = self
            .send(builder, "process instance", &key.to_string())
            .await?;
        Self::decode(response, "process-instances/get").await
    }

    async fn search_process_instances(
        &self,
        req: SearchRequest<ProcessInstanceFilter>,
    ) -> Result<SearchPage<ProcessInstanceResult>> {
        self.post_search("v2/process-instances/search", "process-instances/search", req)
            .await
    }

    async fn search_element_instances(
        &self,
        req: SearchRequest<ElementInstanceFilter>,
    ) -> Result<SearchPage<ElementInstanceResult>> {
        self.post_search("v2/element-instances/search", "element-instances/search", req)
            .await
    }

    async fn search_incidents(
        &self,
        req: SearchRequest<IncidentFilter>,
    ) -> Result<SearchPage<IncidentResult>> {
        self.post_search("v2/incidents/search", "incidents/search", req)
            .await
    }

    async fn search_variables(
        &self,
        req: SearchRequest<VariableFilter>,
    ) -> Result<SearchPage<VariableResult>> {
        self.post_search("v2/variables/search", "variables/search", req)
            .await
    }

    async fn search_user_tasks(
        &self,
        req: SearchRequest<UserTaskFilter>,
    ) -> Result<SearchPage<UserTaskResult>> {
        self.post_search("v2/user-tasks/search", "user-tasks/search", req)
            .await
    }

    async fn complete_user_task(&self, key: UserTaskKey, variables: Variables) -> Result<()> {
        let path = format!("v2/user-tasks/{key}/completion");
        let builder = self
            .gateway_request(Method::POST, &path)?
            .json(&json!({ "variables": variables }));
        self.send(builder, "user task", &key.to_string()).await?;
        Ok(())
    }

    async fn assign_user_task(&self, key: UserTaskKey, assignee: &str) -> Result<()> {
        let path = format!("v2/user-tasks/{key}/assignment");
        let builder = self
            .gateway_request(Method::POST, &path)?
            .json(&json!({ "assignee": assignee }));
        self.send(builder, "user task", &key.to_string()).await?;
        Ok(())
    }

    async fn evaluate_decision(
        &self,
        req: EvaluateDecisionRequest,
    ) -> Result<EvaluateDecisionResult> {
        let id = req.decision_definition_id.clone();
        let builder = self
            .gateway_request(Method::POST, "v2/decision-definitions/evaluation")?
            .json(&req);
        let response = self.send(builder, "decision definition", &id).await?;
        Self::decode(response, "decision-definitions/evaluation").await
    }

    async fn search_decision_instances(
        &self,
        req: SearchRequest<DecisionInstanceFilter>,
    ) -> Result<SearchPage<DecisionInstanceResult>> {
        self.post_search("v2/decision-instances/search", "decision-instances/search", req)
            .await
    }

    async fn get_decision_instance(&self, id: &str) -> Result<DecisionInstanceGetResult> {
        let path = format!("v2/decision-instances/{id}");
        let builder = self.gateway_request(Method::GET, &path)?;
        let response = self.send(builder, "decision instance", id).await?;
        Self::decode(response, "decision-instances/get").await
    }

    async fn activate_jobs(&self, req: ActivateJobsRequest) -> Result<Vec<ActivatedJob>> {
        #[derive(serde::Deserialize)]
        struct Activation {
            jobs: Vec<ActivatedJob>,
        }
        let builder = self
            .gateway_request(Method::POST, "v2/jobs/activation")?
            .json(&req);
        let response = self.send(builder, "job activation", &req.kind).await?;
        let activation: Activation = Self::decode(response, "jobs/activation").await?;
        debug!(kind = %req.kind, activated = activation.jobs.len(), "jobs activated");
        Ok(activation.jobs)
    }

    async fn complete_job(&self, key: JobKey, variables: Variables) -> Result<()> {
        let path = format!("v2/jobs/{key}/completion");
        let builder = self
            .gateway_request(Method::POST, &path)?
            .json(&json!({ "variables": variables }));
        self.send(builder, "job", &key.to_string()).await?;
        Ok(())
    }

    async fn fail_job(&self, key: JobKey, retries: i32, message: &str) -> Result<()> {
        let path = format!("v2/jobs/{key}/failure");
        let builder = self
            .gateway_request(Method::POST, &path)?
            .json(&json!({ "retries": retries, "errorMessage": message }));
        self.send(builder, "job", &key.to_string()).await?;
        Ok(())
    }

    async fn throw_job_error(&self, key: JobKey, code: &str, message: &str) -> Result<()> {
        let path = format!("v2/jobs/{key}/error");
        let builder = self
            .gateway_request(Method::POST, &path)?
            .json(&json!({ "errorCode": code, "errorMessage": message }));
        self.send(builder, "job", &key.to_string()).await?;
        Ok(())
    }

    async fn broadcast_signal(&self, name: &str, variables: Variables) -> Result<()> {
        let builder = self
            .gateway_request(Method::POST, "v2/signals/broadcast")?
            .json(&json!({ "signalName": name, "variables": variables }));
        self.send(builder, "signal", name).await?;
        Ok(())
    }

    async fn publish_message(&self, req: PublishMessageRequest) -> Result<()> {
        let name = req.name.clone();
        let builder = self
            .gateway_request(Method::POST, "v2/messages/publication")?
            .json(&req);
        self.send(builder, "message", &name).await?;
        Ok(())
    }

    async fn topology(&self) -> Result<Topology> {
        let builder = self.gateway_request(Method::GET, "v2/topology")?;
        let response = self.send(builder, "topology", "-").await?;
        Self::decode(response, "topology").await
    }

    async fn clock_current_millis(&self) -> Result<i64> {
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ClockState {
            epoch_milli: i64,
        }
        let builder = self.management_request(Method::GET, "actuator/clock")?;
        let response = self.send(builder, "clock", "-").await?;
        let state: ClockState = Self::decode(response, "clock").await?;
        Ok(state.epoch_milli)
    }

    async fn clock_add(&self, offset: Duration) -> Result<()> {
        let builder = self
            .management_request(Method::POST, "actuator/clock/add")?
            .json(&json!({ "offsetMilli": offset.as_millis() as i64 }));
        self.send(builder, "clock", "-").await?;
        Ok(())
    }

    async fn clock_reset(&self) -> Result<()> {
        let builder = self.management_request(Method::DELETE, "actuator/clock")?;
        self.send(builder, "clock", "-").await?;
        Ok(())
    }
}
