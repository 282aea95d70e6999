//! Message kinds and the wire envelope.
//!
//! The kind is a closed, string-valued enumeration. Wire strings are stable and
//! independent of payload shapes, so payload changes never break kind routing.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every message kind exchanged between runner and test host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "TestDiscovery.Initialize")]
    DiscoveryInitialize,
    #[serde(rename = "TestDiscovery.Start")]
    StartDiscovery,
    #[serde(rename = "TestDiscovery.TestFound")]
    TestCasesFound,
    #[serde(rename = "TestDiscovery.Completed")]
    DiscoveryComplete,
    #[serde(rename = "TestExecution.Initialize")]
    ExecutionInitialize,
    #[serde(rename = "TestExecution.StartWithSources")]
    StartTestExecutionWithSources,
    #[serde(rename = "TestExecution.StartWithTests")]
    StartTestExecutionWithTests,
    #[serde(rename = "TestExecution.StatsChange")]
    TestRunStatsChange,
    #[serde(rename = "TestExecution.Completed")]
    ExecutionComplete,
    #[serde(rename = "TestSession.Message")]
    TestMessage,
    #[serde(rename = "TestExecution.Cancel")]
    CancelTestRun,
    #[serde(rename = "TestExecution.Abort")]
    AbortTestRun,
    #[serde(rename = "TestSession.Terminate")]
    SessionEnd,
    #[serde(rename = "TestExecution.LaunchAdapterProcessWithDebuggerAttached")]
    LaunchAdapterProcessWithDebuggerAttached,
    #[serde(rename = "TestExecution.LaunchAdapterProcessWithDebuggerAttachedCallback")]
    LaunchAdapterProcessWithDebuggerAttachedCallback,
}

impl MessageType {
    /// Wire string for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DiscoveryInitialize => "TestDiscovery.Initialize",
            Self::StartDiscovery => "TestDiscovery.Start",
            Self::TestCasesFound => "TestDiscovery.TestFound",
            Self::DiscoveryComplete => "TestDiscovery.Completed",
            Self::ExecutionInitialize => "TestExecution.Initialize",
            Self::StartTestExecutionWithSources => "TestExecution.StartWithSources",
            Self::StartTestExecutionWithTests => "TestExecution.StartWithTests",
            Self::TestRunStatsChange => "TestExecution.StatsChange",
            Self::ExecutionComplete => "TestExecution.Completed",
            Self::TestMessage => "TestSession.Message",
            Self::CancelTestRun => "TestExecution.Cancel",
            Self::AbortTestRun => "TestExecution.Abort",
            Self::SessionEnd => "TestSession.Terminate",
            Self::LaunchAdapterProcessWithDebuggerAttached => {
                "TestExecution.LaunchAdapterProcessWithDebuggerAttached"
            }
            Self::LaunchAdapterProcessWithDebuggerAttachedCallback => {
                "TestExecution.LaunchAdapterProcessWithDebuggerAttachedCallback"
            }
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded envelope whose payload is not yet bound to a concrete shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "MessageType")]
    pub message_type: MessageType,
    #[serde(rename = "Payload", default)]
    pub payload: Option<Value>,
}

/// Borrowed envelope used on the encode path to avoid cloning payloads.
#[derive(Serialize)]
pub(crate) struct OutgoingMessage<'a, T: Serialize> {
    #[serde(rename = "MessageType")]
    pub message_type: MessageType,
    #[serde(rename = "Payload")]
    pub payload: Option<&'a T>,
}
