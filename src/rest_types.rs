use serde::{Deserialize, Serialize};

use crate::backend::PartResult;
use crate::error::BackendError;

/// Envelope every file API response is wrapped in.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    pub data: Option<T>,
    #[serde(default)]
    pub code: Option<i32>,
}

impl<T> ApiResponse<T> {
    pub fn into_result(self) -> Result<Option<T>, BackendError> {
        if !self.success {
            let message = self
                .message
                .filter(|message| !message.is_empty())
                .unwrap_or_else(|| match self.code {
                    Some(code) => format!("request failed with code {}", code),
                    None => "request failed".to_string(),
                });
            return Err(BackendError::Rejected(message));
        }
        Ok(self.data)
    }

    pub fn into_data(self) -> Result<T, BackendError> {
        self.into_result()?.ok_or(BackendError::MissingData)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteMultipartRequest<'a> {
    pub key: &'a str,
    pub upload_id: &'a str,
    pub parts: &'a [PartResult],
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::UploadSession;

    #[test]
    fn test_init_response_envelope() {
        let json = r#"{"success":true,"message":"ok","code":200,"data":{"uploadId":"u-1","key":"uploads/video/abc.mp4"}}"#;
        let response: ApiResponse<UploadSession> = serde_json::from_str(json).unwrap();
        let session = response.into_data().unwrap();
        assert_eq!(session.upload_id, "u-1");
        assert_eq!(session.key, "uploads/video/abc.mp4");
    }

    #[test]
    fn test_rejected_envelope() {
        let json = r#"{"success":false,"message":"quota exceeded","code":400}"#;
        let response: ApiResponse<String> = serde_json::from_str(json).unwrap();
        match response.into_data() {
            Err(BackendError::Rejected(message)) => assert_eq!(message, "quota exceeded"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_rejected_envelope_without_message() {
        let json = r#"{"success":false,"code":500}"#;
        let response: ApiResponse<String> = serde_json::from_str(json).unwrap();
        match response.into_data() {
            Err(BackendError::Rejected(message)) => assert!(message.contains("500")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_null_data() {
        let json = r#"{"success":true,"data":null}"#;
        let response: ApiResponse<()> = serde_json::from_str(json).unwrap();
        assert!(response.clone().into_result().unwrap().is_none());
        assert!(matches!(response.into_data(), Err(BackendError::MissingData)));
    }

    #[test]
    fn test_complete_request_shape() {
        let parts = vec![
            PartResult {
                part_number: 1,
                e_tag: "a".to_string(),
            },
            PartResult {
                part_number: 2,
                e_tag: "b".to_string(),
            },
        ];
        let request = CompleteMultipartRequest {
            key: "k",
            upload_id: "u",
            parts: &parts,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "key": "k",
                "uploadId": "u",
                "parts": [
                    {"partNumber": 1, "eTag": "a"},
                    {"partNumber": 2, "eTag": "b"}
                ]
            })
        );
    }
}
