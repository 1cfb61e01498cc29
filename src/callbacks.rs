//! Dispatch of server-initiated events to application callbacks.
//!
//! Callbacks are stored here, separately from the subscription
//! accounting: the pipeline's state stage tracks *which* event categories
//! are enabled, while the transport leaf pushes arriving events through
//! this dispatcher. Callbacks must not block; they run on the transport's
//! receive task.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::message::{DesiredPropertyUpdate, DirectMethodRequest, ReceivedMessage};

pub type MessageCallback = Arc<dyn Fn(ReceivedMessage) + Send + Sync>;
pub type DirectMethodCallback = Arc<dyn Fn(DirectMethodRequest) + Send + Sync>;
pub type DesiredPropertyCallback = Arc<dyn Fn(DesiredPropertyUpdate) + Send + Sync>;

#[derive(Default)]
pub struct EventDispatcher {
    message: Mutex<Option<MessageCallback>>,
    method: Mutex<Option<DirectMethodCallback>>,
    desired: Mutex<Option<DesiredPropertyCallback>>,
    inputs: Mutex<HashMap<String, MessageCallback>>,
}

impl EventDispatcher {
    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.message.lock().unwrap() = Some(callback);
    }

    pub fn set_method_callback(&self, callback: DirectMethodCallback) {
        *self.method.lock().unwrap() = Some(callback);
    }

    pub fn set_desired_property_callback(&self, callback: DesiredPropertyCallback) {
        *self.desired.lock().unwrap() = Some(callback);
    }

    pub fn set_input_callback(&self, input_name: impl Into<String>, callback: MessageCallback) {
        self.inputs
            .lock()
            .unwrap()
            .insert(input_name.into(), callback);
    }

    /// Delivers a C2D message; returns false when no callback is
    /// registered so the transport can queue it for `receive_message`.
    pub fn dispatch_message(&self, message: ReceivedMessage) -> Result<(), ReceivedMessage> {
        let callback = self.message.lock().unwrap().clone();
        match callback {
            Some(callback) => {
                callback(message);
                Ok(())
            }
            None => Err(message),
        }
    }

    pub fn dispatch_method(&self, request: DirectMethodRequest) {
        let callback = self.method.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(request);
        }
    }

    pub fn dispatch_desired_update(&self, update: DesiredPropertyUpdate) {
        let callback = self.desired.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(update);
        }
    }

    /// Delivers a message arriving on a module input; returns the message
    /// back when no callback is registered for that input.
    pub fn dispatch_input(
        &self,
        input_name: &str,
        message: ReceivedMessage,
    ) -> Result<(), ReceivedMessage> {
        let callback = self.inputs.lock().unwrap().get(input_name).cloned();
        match callback {
            Some(callback) => {
                callback(message);
                Ok(())
            }
            None => Err(message),
        }
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("message", &self.message.lock().unwrap().is_some())
            .field("method", &self.method.lock().unwrap().is_some())
            .field("desired", &self.desired.lock().unwrap().is_some())
            .field("inputs", &self.inputs.lock().unwrap().len())
            .finish()
    }
}
