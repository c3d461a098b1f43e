//! Query service facade
//!
//! Ties the pieces together for a protocol adapter: a parsed [`Request`] is
//! assembled into a query tree, expand columns are planned as child queries,
//! navigation paths are lowered into `EXISTS` chains, to-one member paths such
//! as `author.name` into scalar sub-selects, and everything is compiled into
//! parameterized SQL for the configured dialect.
//!
//! ```no_run
//! use cqn_service::Service;
//!
//! let service = Service::from_config("config.yaml")?;
//! let request = serde_json::from_str(r#"{
//!     "intent": "read",
//!     "segments": [{ "kind": "entity-collection", "name": "CatalogService.Books" }]
//! }"#)?;
//! let plan = service.read(&request)?;
//! println!("{}", plan.main.text);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod logging;
mod plan;

use chrono::{DateTime, Utc};
use cqn_ir::{Expr, Query, Select, Source, SubSelect};
use cqn_model::{Entity, Model};
use cqn_odata::{
    addressed_entity, lower_member_paths, lower_navigation, lower_write, AssembleOptions, Assembler, Intent, Request,
    SegmentKind, TranslateError,
};
use cqn_sql::{CompileError, CompileOptions, CompiledQuery};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info_span, trace};

pub use config::{Config, ConfigError};
pub use plan::ExpandPlan;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Translate(#[from] TranslateError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{operation} does not take {intent:?} requests")]
    WrongIntent { operation: &'static str, intent: Intent },

    #[error("Feature not supported: {0}")]
    Unsupported(String),
}

/// Everything a read needs, compiled
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadPlan {
    pub main: CompiledQuery,

    /// Must return a row, or the addressed entity does not exist
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<CompiledQuery>,

    /// An empty `main` result is an empty collection rather than not-found
    pub nav_to_many: bool,

    /// Total row count for `$count=true`, ignoring paging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<CompiledQuery>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub expands: Vec<CompiledExpand>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledExpand {
    #[serde(flatten)]
    pub plan: ExpandPlan,
    pub query: CompiledQuery,
}

/// Read-only after construction; share it across threads behind an `Arc`
#[derive(Debug, Clone)]
pub struct Service {
    model: Arc<Model>,
    config: Config,
    compile_options: CompileOptions,
    now: Option<DateTime<Utc>>,
}

impl Service {
    pub fn new(model: Arc<Model>, config: Config) -> Self {
        let compile_options = config.sql.compile_options();
        Self { model, config, compile_options, now: None }
    }

    /// Load the configuration and the model file it names
    pub fn from_config<P: AsRef<Path>>(path: P) -> Result<Self, ServiceError> {
        Self::load(Config::load(path)?)
    }

    /// Load the model file an already loaded configuration names
    pub fn load(config: Config) -> Result<Self, ServiceError> {
        let model_path = config.model.path.clone().ok_or(ConfigError::MissingModel)?;
        let json = std::fs::read_to_string(&model_path).map_err(ConfigError::from)?;
        let model = Model::from_json_str(&json).map_err(ConfigError::from)?;
        debug!(model = %model_path.display(), entities = model.entities().count(), "Loaded model");
        Ok(Self::new(Arc::new(model), config))
    }

    /// Pin the clock `now()` reads
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn assembler(&self) -> Assembler<'_> {
        let options = AssembleOptions { max_page_size: self.config.odata.max_page_size };
        let assembler = Assembler::new(&self.model).with_options(options);
        match self.now {
            Some(now) => assembler.at(now),
            None => assembler,
        }
    }

    /// Compile a tree produced elsewhere, e.g. by the fluent builder
    pub fn compile(&self, query: &Query) -> Result<CompiledQuery, ServiceError> {
        let compiled = cqn_sql::compile(query, &self.compile_options)?;
        log_event!(
            level: tracing::Level::DEBUG,
            event: "query_compiled",
            kind: query.kind(),
            fingerprint: query.fingerprint(),
            placeholders: compiled.values.len()
        );
        Ok(compiled)
    }

    pub fn read(&self, request: &Request) -> Result<ReadPlan, ServiceError> {
        let span = info_span!("read", segments = request.segments.len());
        let _guard = span.enter();
        if request.intent != Intent::Read {
            return Err(ServiceError::WrongIntent { operation: "read", intent: request.intent });
        }

        let assembled = self.assembler().assemble(request)?;
        let mut select = match assembled.query {
            Query::Select(select) => select,
            other => return Err(ServiceError::Unsupported(format!("{} for a read", other.kind()))),
        };
        let entity = addressed_entity(&request.segments, &self.model)?;
        let planner = plan::Planner::new(&self.model);

        let mut columns = std::mem::take(&mut select.columns);
        if !select.group_by.is_empty() {
            columns = plan::flatten_expands(columns);
        }
        let (mut columns, expands) = plan::split_expands(columns);
        planner.link_columns(entity, &expands, &mut columns)?;
        select.columns = columns;
        let select = self.lower(select, entity, request)?;

        let count = match (request.options.count, request.last_kind()) {
            (true, Some(kind)) if kind != SegmentKind::Count => Some(self.compile(&Query::Select(count_query(&select)))?),
            _ => None,
        };

        let mut planned = Vec::new();
        planner.plan(&select, entity, expands, &[], &mut planned)?;
        let expands = planned
            .into_iter()
            .map(|plan| {
                let query = self.compile(&Query::Select(plan.select().clone()))?;
                Ok(CompiledExpand { plan, query })
            })
            .collect::<Result<Vec<_>, ServiceError>>()?;

        let (validation, nav_to_many) = match assembled.validation {
            Some(v) => (Some(self.compile(&Query::Select(v.select))?), v.nav_to_many),
            None => (None, false),
        };

        let main = self.compile(&Query::Select(select))?;
        trace!(sql = %main.text, expands = expands.len(), "Planned read");
        Ok(ReadPlan { main, validation, nav_to_many, count, expands })
    }

    /// Create, update and delete
    pub fn write(&self, request: &Request) -> Result<CompiledQuery, ServiceError> {
        let span = info_span!("write", intent = ?request.intent);
        let _guard = span.enter();
        if !matches!(request.intent, Intent::Create | Intent::Update | Intent::Delete) {
            return Err(ServiceError::WrongIntent { operation: "write", intent: request.intent });
        }

        let query = self.assembler().assemble(request)?.query;
        let query = if self.config.odata.lower_navigation {
            lower_write(query, &request.segments, &self.model)?
        } else {
            query
        };
        self.compile(&query)
    }

    /// Select of the binding parameter of a bound action or function
    pub fn invoke(&self, request: &Request) -> Result<CompiledQuery, ServiceError> {
        let span = info_span!("invoke", segments = request.segments.len());
        let _guard = span.enter();
        if request.intent != Intent::Invoke {
            return Err(ServiceError::WrongIntent { operation: "invoke", intent: request.intent });
        }

        match self.assembler().assemble(request)?.query {
            Query::Select(select) => {
                let binding: Vec<_> = request
                    .segments
                    .iter()
                    .take_while(|s| !matches!(s.kind, SegmentKind::BoundAction | SegmentKind::BoundFunction))
                    .cloned()
                    .collect();
                let select = if self.config.odata.lower_navigation {
                    lower_navigation(select, &binding, &self.model)?
                } else {
                    select
                };
                self.compile(&Query::Select(select))
            }
            other => self.compile(&other),
        }
    }

    /// Navigation segments into `EXISTS` chains, then to-one member paths
    /// into scalar sub-selects
    fn lower(&self, select: Select, entity: &Entity, request: &Request) -> Result<Select, ServiceError> {
        if !self.config.odata.lower_navigation {
            return Ok(select);
        }
        let select = lower_navigation(select, &request.segments, &self.model)?;
        Ok(lower_member_paths(select, entity, &self.model)?)
    }
}

/// `count(1)` over the rows of `select` without its paging
fn count_query(select: &Select) -> Select {
    let mut inner = select.clone();
    inner.limit = None;
    inner.one = false;
    inner.order_by.clear();

    let count = Expr::func("count", vec![Expr::val(1)]).with_alias("$count");
    if inner.group_by.is_empty() && !inner.distinct {
        inner.columns = vec![count];
        return inner;
    }

    let mut outer = Select::new(Source::Select(SubSelect { alias: Some("counted".into()), ..SubSelect::new(inner) }));
    outer.columns = vec![count];
    outer
}
