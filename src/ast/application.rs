//! Top-level document nodes: application, component, datasource.

use super::Node;
use serde::Serialize;
use std::collections::BTreeMap;

/// Application render/runtime target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    Html,
    Terminal,
    Desktop,
    Game,
    Api,
    Microservices,
    Library,
}

impl AppType {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "html" => Some(AppType::Html),
            "terminal" => Some(AppType::Terminal),
            "desktop" => Some(AppType::Desktop),
            "game" => Some(AppType::Game),
            "api" => Some(AppType::Api),
            "microservices" => Some(AppType::Microservices),
            "library" => Some(AppType::Library),
            _ => None,
        }
    }
}

/// Driver selected by a datasource's `type` attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasourceType {
    Postgres,
    Mysql,
    Sqlite,
    Mssql,
    Redis,
    Llm,
    Knowledge,
    Queue,
    Cache,
    Http,
    Filesystem,
    /// Provider types the core does not interpret are preserved verbatim.
    Other(String),
}

impl DatasourceType {
    pub fn parse(text: &str) -> Self {
        match text {
            "postgres" | "postgresql" => DatasourceType::Postgres,
            "mysql" => DatasourceType::Mysql,
            "sqlite" => DatasourceType::Sqlite,
            "mssql" => DatasourceType::Mssql,
            "redis" => DatasourceType::Redis,
            "llm" => DatasourceType::Llm,
            "knowledge" => DatasourceType::Knowledge,
            "queue" => DatasourceType::Queue,
            "cache" => DatasourceType::Cache,
            "http" => DatasourceType::Http,
            "filesystem" => DatasourceType::Filesystem,
            other => DatasourceType::Other(other.to_string()),
        }
    }

    /// True for datasources served by the database collaborator.
    pub fn is_database(&self) -> bool {
        matches!(
            self,
            DatasourceType::Postgres
                | DatasourceType::Mysql
                | DatasourceType::Sqlite
                | DatasourceType::Mssql
        )
    }
}

/// `<datasource id="db" type="postgres" host="..." />`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasourceNode {
    pub id: String,
    pub ds_type: DatasourceType,
    /// Provider-specific attributes, preserved verbatim.
    pub attributes: Vec<(String, String)>,
}

impl DatasourceNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.id.is_empty() {
            errors.push("datasource requires an 'id' attribute".into());
        }
        errors
    }

    /// Look up a provider-specific attribute.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// `<q:component name="C">statements</q:component>`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentNode {
    pub name: String,
    pub statements: Vec<Node>,
}

impl ComponentNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.name.is_empty() {
            errors.push("q:component requires a 'name' attribute".into());
        }
        errors
    }
}

/// `<q:application id="app" type="html">datasources + components + ...</q:application>`
///
/// Game applications collect `qg:scene`/`qg:prefab`/`qg:behavior` children
/// into their own lists; terminal applications collect `qt:screen`s; desktop
/// applications collect `ui:window`s. Everything else lands in `statements`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplicationNode {
    pub id: Option<String>,
    pub app_type: AppType,
    pub engine: Option<String>,
    pub attributes: Vec<(String, String)>,
    pub datasources: BTreeMap<String, DatasourceNode>,
    pub components: Vec<ComponentNode>,
    pub scenes: Vec<Node>,
    pub screens: Vec<Node>,
    pub prefabs: Vec<Node>,
    pub behaviors: Vec<Node>,
    pub windows: Vec<Node>,
    pub statements: Vec<Node>,
}

impl ApplicationNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for ds in self.datasources.values() {
            errors.extend(ds.validate());
        }
        for component in &self.components {
            errors.extend(component.validate());
        }
        if self.app_type == AppType::Game && self.scenes.is_empty() {
            errors.push("game application requires at least one qg:scene".into());
        }
        errors
    }

    /// Datasource lookup by id.
    pub fn datasource(&self, id: &str) -> Option<&DatasourceNode> {
        self.datasources.get(id)
    }
}
