use axum::{
    body::Bytes,
    extract::{Path, RawQuery, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use modelops::{ModelName, ModelStatus};
use serde::{Deserialize, Serialize};

use crate::controller::{Files, UpdateOutcome};
use crate::endpoint::HttpMethod;
use crate::error::ControlError;
use crate::state::SharedState;

#[derive(Serialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelStatus>,
}

#[derive(Deserialize)]
pub struct UpdateReq {
    #[serde(default)]
    pub files: Files,
}

#[derive(Serialize)]
pub struct ApiError {
    pub error: String,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

fn api_error(code: StatusCode, error: impl ToString) -> (StatusCode, Json<ApiError>) {
    (code, Json(ApiError { error: error.to_string() }))
}

fn parse_name(raw: String) -> ApiResult<ModelName> {
    ModelName::new(raw).map_err(|e| api_error(StatusCode::BAD_REQUEST, e))
}

impl From<ControlError> for (StatusCode, Json<ApiError>) {
    fn from(e: ControlError) -> Self {
        let code = match &e {
            ControlError::UnknownModel(_) => StatusCode::NOT_FOUND,
            ControlError::NotServing(_) => StatusCode::SERVICE_UNAVAILABLE,
            ControlError::EndpointUnreachable { .. } => StatusCode::BAD_GATEWAY,
            ControlError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        api_error(code, e)
    }
}

pub async fn get_health(State(st): State<SharedState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "model_root": st.config.model_root,
        "models": st.manager.statuses().await.len(),
    }))
}

pub async fn get_models(State(st): State<SharedState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: st.manager.statuses().await,
    })
}

pub async fn get_model(
    State(st): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ModelStatus>> {
    let name = parse_name(name)?;
    st.manager
        .status(&name)
        .await
        .map(Json)
        .ok_or_else(|| ControlError::UnknownModel(name.to_string()).into())
}

/// Writes the submitted files and starts a training run.
pub async fn put_model(
    State(st): State<SharedState>,
    Path(name): Path<String>,
    Json(req): Json<UpdateReq>,
) -> ApiResult<(StatusCode, Json<ModelStatus>)> {
    let name = parse_name(name)?;
    match st.manager.request_update(&name, &req.files).await? {
        UpdateOutcome::Accepted(status) => Ok((StatusCode::ACCEPTED, Json(status))),
        UpdateOutcome::Busy(status) => Ok((StatusCode::CONFLICT, Json(status))),
        UpdateOutcome::Rejected(reason) => Err(api_error(StatusCode::BAD_REQUEST, reason)),
    }
}

pub async fn delete_model(
    State(st): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ModelStatus>> {
    let name = parse_name(name)?;
    Ok(Json(st.manager.stop(&name).await?))
}

/// `path` plus the original query string, if any.
fn upstream_path(path: &str, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("{path}?{q}"),
        _ => path.to_string(),
    }
}

/// Forwards the request to whichever slot currently serves the model.
pub async fn proxy_model(
    State(st): State<SharedState>,
    Path((name, path)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    method: Method,
    body: Bytes,
) -> ApiResult<Response> {
    let name = parse_name(name)?;
    let method = match method {
        Method::GET => HttpMethod::Get,
        Method::POST => HttpMethod::Post,
        Method::PUT => HttpMethod::Put,
        other => return Err(api_error(StatusCode::METHOD_NOT_ALLOWED, format!("unsupported method {other}"))),
    };
    let path = upstream_path(&path, query.as_deref());
    let (code, payload) = st.manager.proxy(&name, method, &path, body).await?;
    let code = StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY);
    Ok((code, [(header::CONTENT_TYPE, "application/json")], payload).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        let (code, body) = <(StatusCode, Json<ApiError>)>::from(ControlError::UnknownModel("faq".into()));
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert_eq!(body.0.error, "unknown model faq");

        let (code, _) = <(StatusCode, Json<ApiError>)>::from(ControlError::NotServing("faq".into()));
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_update_body_defaults_to_no_files() {
        let req: UpdateReq = serde_json::from_str("{}").unwrap();
        assert!(req.files.is_empty());
        let req: UpdateReq =
            serde_json::from_str(r#"{"files":{"data/nlu.yml":"nlu: []"}}"#).unwrap();
        assert_eq!(req.files["data/nlu.yml"], "nlu: []");
    }

    #[test]
    fn test_upstream_path_keeps_query() {
        assert_eq!(
            upstream_path("conversations/x/tracker", Some("include_events=ALL")),
            "conversations/x/tracker?include_events=ALL"
        );
        assert_eq!(upstream_path("version", Some("")), "version");
        assert_eq!(upstream_path("version", None), "version");
    }

    #[test]
    fn test_invalid_name_is_bad_request() {
        let err = parse_name("../etc".to_string()).unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }
}
