use crate::types::{ExecutionStatus, JobRequest, JobResponse};
use redis::{AsyncCommands, RedisResult};

/// Redis queue semantics shared by producers (web layer, CLI) and the worker.
/// Keys are deterministic so both sides never drift.

pub const QUEUE_KEY: &str = "scriptbox:queue";
pub const RESULT_PREFIX: &str = "scriptbox:result";
pub const STATUS_PREFIX: &str = "scriptbox:status";

/// Results live for 24 hours.
pub const RESULT_TTL_SECS: u64 = 86_400;

pub fn result_key(job_id: &uuid::Uuid) -> String {
    format!("{}:{}", RESULT_PREFIX, job_id)
}

pub fn status_key(job_id: &uuid::Uuid) -> String {
    format!("{}:{}", STATUS_PREFIX, job_id)
}

fn serde_error(kind: &'static str, e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, kind, e.to_string()))
}

/// Push a job onto the queue (RPUSH, FIFO with BLPOP).
pub async fn push_job(
    conn: &mut redis::aio::ConnectionManager,
    job: &JobRequest,
) -> RedisResult<()> {
    let payload = serde_json::to_string(job).map_err(|e| serde_error("serialization error", e))?;
    conn.rpush(QUEUE_KEY, payload).await
}

/// Pop a job, waiting up to `timeout_seconds` so callers can observe shutdown.
pub async fn pop_job(
    conn: &mut redis::aio::ConnectionManager,
    timeout_seconds: f64,
) -> RedisResult<Option<JobRequest>> {
    let result: Option<(String, String)> = conn.blpop(QUEUE_KEY, timeout_seconds).await?;

    match result {
        Some((_key, payload)) => {
            let job: JobRequest = serde_json::from_str(&payload)
                .map_err(|e| serde_error("deserialization error", e))?;
            Ok(Some(job))
        }
        None => Ok(None),
    }
}

pub async fn store_result(
    conn: &mut redis::aio::ConnectionManager,
    response: &JobResponse,
) -> RedisResult<()> {
    let key = result_key(&response.job_id);
    let payload =
        serde_json::to_string(response).map_err(|e| serde_error("serialization error", e))?;
    let _: () = conn.set_ex(&key, payload, RESULT_TTL_SECS as _).await?;

    // Status separately for cheap polling
    let status: ExecutionStatus = response.result.status;
    let _: () = conn
        .set_ex(status_key(&response.job_id), status.to_string(), RESULT_TTL_SECS as _)
        .await?;

    Ok(())
}

pub async fn get_result(
    conn: &mut redis::aio::ConnectionManager,
    job_id: &uuid::Uuid,
) -> RedisResult<Option<JobResponse>> {
    let payload: Option<String> = conn.get(result_key(job_id)).await?;

    match payload {
        Some(data) => {
            let response: JobResponse = serde_json::from_str(&data)
                .map_err(|e| serde_error("deserialization error", e))?;
            Ok(Some(response))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_result_key_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(result_key(&id), result_key(&id));
        assert!(result_key(&id).starts_with("scriptbox:result:"));
    }

    #[test]
    fn test_status_key_format() {
        let id = Uuid::new_v4();
        let key = status_key(&id);
        assert!(key.starts_with("scriptbox:status:"));
        assert!(key.contains(&id.to_string()));
    }
}
