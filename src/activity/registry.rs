use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, RuntimeError};
use crate::launch::LaunchSpec;

use super::Activity;

/// Factory responsible for creating a fresh [`Activity`] instance for a launch.
pub type ActivityFactory = Arc<dyn Fn(&LaunchSpec) -> Box<dyn Activity> + Send + Sync>;

/// Declarative activity definition registered under an application.
#[derive(Clone)]
pub struct ActivityDefinition {
    pub id: String,
    pub title: String,
    pub factory: ActivityFactory,
    pub metadata: ActivityMetadata,
}

impl ActivityDefinition {
    pub fn new(id: impl Into<String>, title: impl Into<String>, factory: ActivityFactory) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            factory,
            metadata: ActivityMetadata::default(),
        }
    }

    /// Convenience constructor for activities that ignore their launch spec.
    pub fn from_fn<F, A>(id: impl Into<String>, title: impl Into<String>, make: F) -> Self
    where
        F: Fn() -> A + Send + Sync + 'static,
        A: Activity,
    {
        Self::new(
            id,
            title,
            Arc::new(move |_: &LaunchSpec| -> Box<dyn Activity> { Box::new(make()) }),
        )
    }

    pub fn with_metadata(mut self, metadata: ActivityMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Optional metadata carried alongside an activity definition.
#[derive(Default, Clone, Debug)]
pub struct ActivityMetadata {
    pub description: Option<String>,
    pub shortcuts: Vec<String>,
}

/// A named group of activities with one entry point.
#[derive(Clone)]
pub struct ApplicationDefinition {
    pub id: String,
    pub main_activity: String,
    activities: HashMap<String, ActivityDefinition>,
}

impl ApplicationDefinition {
    pub fn new(id: impl Into<String>, main_activity: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            main_activity: main_activity.into(),
            activities: HashMap::new(),
        }
    }

    pub fn with_activity(mut self, definition: ActivityDefinition) -> Self {
        self.activities.insert(definition.id.clone(), definition);
        self
    }

    pub fn activity(&self, id: &str) -> Option<&ActivityDefinition> {
        self.activities.get(id)
    }

    pub fn activity_ids(&self) -> impl Iterator<Item = &str> {
        self.activities.keys().map(String::as_str)
    }
}

/// Lookup table from `(application, activity)` to definitions.
#[derive(Default, Clone)]
pub struct ActivityRegistry {
    applications: HashMap<String, ApplicationDefinition>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_application(&mut self, application: ApplicationDefinition) {
        self.applications.insert(application.id.clone(), application);
    }

    pub fn with_application(mut self, application: ApplicationDefinition) -> Self {
        self.register_application(application);
        self
    }

    pub fn application(&self, id: &str) -> Result<&ApplicationDefinition> {
        self.applications
            .get(id)
            .ok_or_else(|| RuntimeError::UnknownApplication(id.to_string()))
    }

    pub fn resolve(&self, application: &str, activity: &str) -> Result<&ActivityDefinition> {
        self.application(application)?
            .activity(activity)
            .ok_or_else(|| RuntimeError::UnknownActivity {
                application: application.to_string(),
                activity: activity.to_string(),
            })
    }
}
