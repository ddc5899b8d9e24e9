//! # Bus Wire Messages
//!
//! JSON payloads exchanged over the FIFO bus: the task message the
//! orchestrator enqueues on a workers tube, and the reply a worker posts
//! back on the orchestrator's reply tube. The `res`/`exc` payloads are
//! opaque to the orchestrator; only the module reducers interpret them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::record::JsonMap;

/// Where a worker should post the reply for one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyAddress {
    pub addr: String,
    pub tube: String,
}

/// Task message enqueued on a workers tube
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub job_id: String,
    /// Stable executor token, resolved worker-side
    pub task: String,
    pub item: String,
    #[serde(default)]
    pub kwargs: JsonMap,
    pub beanstalkd_reply: ReplyAddress,
}

/// Typed error descriptor carried in a reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExcInfo {
    pub class_name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retriable: Option<bool>,
}

/// Reply posted by a worker after running one task.
///
/// `exc` is kept as raw JSON here: a malformed exception descriptor must be
/// reduced into the job's error histogram, not crash the reply loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyMessage {
    pub job_id: String,
    #[serde(default)]
    pub res: Option<Value>,
    #[serde(default)]
    pub exc: Option<Value>,
}

impl ReplyMessage {
    /// A successful reply
    pub fn success(job_id: impl Into<String>, res: Option<Value>) -> Self {
        Self {
            job_id: job_id.into(),
            res,
            exc: None,
        }
    }

    /// An error reply
    pub fn error(job_id: impl Into<String>, exc: ExcInfo) -> Self {
        Self {
            job_id: job_id.into(),
            res: None,
            exc: serde_json::to_value(exc).ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_message_round_trip() {
        let message = TaskMessage {
            job_id: "20190701120000000000-0000000000A".to_string(),
            task: "tester".to_string(),
            item: "myitem-0".to_string(),
            kwargs: json!({"error_percentage": 0}).as_object().unwrap().clone(),
            beanstalkd_reply: ReplyAddress {
                addr: "127.0.0.1:6005".to_string(),
                tube: "xjob-reply".to_string(),
            },
        };

        let encoded = serde_json::to_vec(&message).unwrap();
        let decoded: TaskMessage = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.item, "myitem-0");
        assert_eq!(decoded.beanstalkd_reply, message.beanstalkd_reply);
    }

    #[test]
    fn test_null_exc_means_success() {
        let raw = json!({"job_id": "x", "res": null, "exc": null});
        let reply: ReplyMessage = serde_json::from_value(raw).unwrap();
        assert!(reply.exc.is_none());
        assert!(reply.res.is_none());
    }

    #[test]
    fn test_error_reply_carries_class_name() {
        let reply = ReplyMessage::error(
            "x",
            ExcInfo {
                class_name: "ServiceBusy".to_string(),
                message: "try later".to_string(),
                retriable: Some(true),
            },
        );
        let exc = reply.exc.unwrap();
        assert_eq!(exc["class_name"], json!("ServiceBusy"));
        assert_eq!(exc["retriable"], json!(true));
    }
}
