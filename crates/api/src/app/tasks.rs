//! Task registration table for this service.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::info;

use conveyor_core::{HandlerError, RetryPolicy};
use conveyor_infra::jobs::{TaskContext, TaskRegistry};

pub const SEND_EMAIL: &str = "example.send_email";
pub const PROCESS_DATA: &str = "example.process_data";

/// All tasks this service can submit and execute.
pub fn registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry
        .register(SEND_EMAIL, send_email_policy(), send_email)
        .register(PROCESS_DATA, RetryPolicy::no_retry(), process_data);
    registry
}

/// 3 retries, 60s doubling to at most 600s, jittered. Bad arguments are
/// never retried.
pub fn send_email_policy() -> RetryPolicy {
    RetryPolicy::exponential(3, Duration::from_secs(60), Duration::from_secs(600))
        .with_multiplier(2.0)
        .with_jitter(true)
        .retry_if(retry_unless_invalid)
}

fn retry_unless_invalid(err: &HandlerError) -> bool {
    !matches!(err, HandlerError::InvalidArguments(_))
}

#[derive(Debug, Deserialize)]
struct SendEmailArgs {
    to: String,
    subject: String,
    body: String,
}

/// Simulated email delivery. Safe to run more than once.
async fn send_email(ctx: TaskContext) -> Result<Value, HandlerError> {
    let args: SendEmailArgs = ctx.kwargs_as()?;
    if !is_valid_email(&args.to) {
        return Err(HandlerError::invalid_arguments(format!(
            "invalid recipient address: {}",
            args.to
        )));
    }

    info!(
        task_id = %ctx.task_id,
        to = %args.to,
        subject = %args.subject,
        body_len = args.body.len(),
        retries = ctx.retries,
        "sending email (simulated)"
    );

    Ok(json!({
        "status": "success",
        "task_id": ctx.task_id.to_string(),
        "to": args.to,
        "subject": args.subject,
        "message": "Email sent successfully (simulated)",
    }))
}

async fn process_data(ctx: TaskContext) -> Result<Value, HandlerError> {
    let data: Map<String, Value> = ctx.kwarg("data")?;
    let keys: Vec<&str> = data.keys().map(String::as_str).collect();
    info!(task_id = %ctx.task_id, data_keys = ?keys, "processing data");

    let n = data.len();
    Ok(json!({
        "status": "success",
        "task_id": ctx.task_id.to_string(),
        "processed_items": n,
        "result": format!("Processed {n} items"),
    }))
}

/// Shape check for a recipient address: `local@domain.tld`, no whitespace.
pub fn is_valid_email(addr: &str) -> bool {
    if addr.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = addr.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    labels.len() >= 2 && labels.iter().all(|l| !l.is_empty())
}

#[cfg(test)]
mod tests {
    use conveyor_core::{TaskArgs, TaskInvocation};

    use super::*;

    fn ctx(task: &str, kwargs: Value) -> TaskContext {
        let args = TaskArgs::from_kwargs(&kwargs).unwrap();
        TaskContext::from_invocation(&TaskInvocation::new(task, args))
    }

    #[test]
    fn registers_both_tasks() {
        let registry = registry();
        assert_eq!(registry.names(), vec![PROCESS_DATA, SEND_EMAIL]);
        assert_eq!(registry.get(PROCESS_DATA).unwrap().policy.max_retries, 0);
        assert_eq!(registry.get(SEND_EMAIL).unwrap().policy.max_retries, 3);
    }

    #[test]
    fn email_policy_skips_invalid_arguments() {
        let policy = send_email_policy();
        assert!(policy.should_retry(0, &HandlerError::permanent("smtp said no")));
        assert!(policy.should_retry(2, &HandlerError::transient("timeout")));
        assert!(!policy.should_retry(3, &HandlerError::transient("timeout")));
        assert!(!policy.should_retry(0, &HandlerError::invalid_arguments("bad")));
        assert_eq!(policy.delay_for_retry(0), Duration::from_secs(60));
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(120));
        assert_eq!(policy.delay_for_retry(5), Duration::from_secs(600));
    }

    #[tokio::test]
    async fn send_email_returns_the_delivery_summary() {
        let ctx = ctx(
            SEND_EMAIL,
            json!({"to": "test@example.com", "subject": "Hi", "body": "Hello"}),
        );
        let id = ctx.task_id.to_string();

        let out = send_email(ctx.clone()).await.unwrap();
        assert_eq!(out["status"], "success");
        assert_eq!(out["task_id"], id);
        assert_eq!(out["to"], "test@example.com");
        assert_eq!(out["subject"], "Hi");

        // Same input, same outcome.
        assert_eq!(send_email(ctx).await.unwrap(), out);
    }

    #[tokio::test]
    async fn send_email_rejects_bad_arguments() {
        let err = send_email(ctx(
            SEND_EMAIL,
            json!({"to": "nobody", "subject": "Hi", "body": "Hello"}),
        ))
        .await
        .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidArguments(_)));

        let err = send_email(ctx(SEND_EMAIL, json!({"to": "a@b.io"}))).await.unwrap_err();
        assert!(matches!(err, HandlerError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn process_data_counts_keys() {
        let out = process_data(ctx(PROCESS_DATA, json!({"data": {"a": 1, "b": 2, "c": 3}})))
            .await
            .unwrap();
        assert_eq!(out["processed_items"], 3);
        assert_eq!(out["result"], "Processed 3 items");

        let out = process_data(ctx(PROCESS_DATA, json!({"data": {}}))).await.unwrap();
        assert_eq!(out["processed_items"], 0);
    }

    #[test]
    fn email_shapes() {
        for ok in ["test@example.com", "a.b+c@mail.example.org"] {
            assert!(is_valid_email(ok), "{ok}");
        }
        for bad in ["", "test", "@example.com", "test@", "test@example", "a b@c.com", "a@@b.com", "a@b..com"] {
            assert!(!is_valid_email(bad), "{bad}");
        }
    }
}
