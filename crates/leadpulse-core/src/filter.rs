//! Advanced filter compilation.
//!
//! Turns user-supplied `(property, operator, value)` triples into a SQL
//! predicate fragment with positional `?` placeholders. Fragments start with
//! ` AND ` so they can be appended directly after mandatory scope predicates
//! (date range, explicit ids), which are never part of an OR group.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Upper bound on filters accepted in one request.
pub const MAX_FILTERS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    /// Any operator string this engine does not know. Compiles to nothing.
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FilterCondition {
    #[default]
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvancedFilter {
    #[serde(default)]
    pub id: String,
    pub property: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: String,
}

impl AdvancedFilter {
    pub fn new(property: &str, operator: FilterOperator, value: &str) -> Self {
        Self {
            id: String::new(),
            property: property.to_string(),
            operator,
            value: value.to_string(),
        }
    }
}

/// Entities of the dashboard schema and their fixed SQL aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Event,
    User,
    Session,
    Profession,
    Product,
    Funnel,
}

impl Entity {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "event" | "events" => Some(Self::Event),
            "user" | "users" => Some(Self::User),
            "session" | "sessions" => Some(Self::Session),
            "profession" | "professions" => Some(Self::Profession),
            "product" | "products" => Some(Self::Product),
            "funnel" | "funnels" => Some(Self::Funnel),
            _ => None,
        }
    }

    pub fn alias(self) -> &'static str {
        match self {
            Self::Event => "e",
            Self::User => "u",
            Self::Session => "s",
            Self::Profession => "p",
            Self::Product => "pr",
            Self::Funnel => "f",
        }
    }

    /// Whether a query rooted at `root` joins this entity.
    ///
    /// Event-rooted queries join everything; session-rooted queries reach
    /// every entity except events.
    pub fn reachable_from(self, root: Entity) -> bool {
        match root {
            Entity::Event => true,
            Entity::Session => self != Entity::Event,
            other => self == other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
    Decimal,
    Timestamp,
}

/// Logical `(entity, field)` to stored column name and type.
///
/// Attribution columns on `users` are stored camelCased, so they differ from
/// the logical snake_case name.
pub fn physical_column(entity: Entity, field: &str) -> Option<(&'static str, ColumnKind)> {
    use ColumnKind::*;
    let column = match (entity, field) {
        (_, "id") => ("id", Integer),
        (_, "created_at") => ("created_at", Timestamp),

        (Entity::Event, "type") => ("type", Text),
        (Entity::Event, "user_id") => ("user_id", Integer),
        (Entity::Event, "session_id") => ("session_id", Integer),
        (Entity::Event, "profession_id") => ("profession_id", Integer),
        (Entity::Event, "product_id") => ("product_id", Integer),
        (Entity::Event, "funnel_id") => ("funnel_id", Integer),
        (Entity::Event, "amount") => ("amount", Decimal),

        (Entity::User, "name") => ("name", Text),
        (Entity::User, "email") => ("email", Text),
        (Entity::User, "phone") => ("phone", Text),
        (Entity::User, "utm_source") => ("utmSource", Text),
        (Entity::User, "utm_medium") => ("utmMedium", Text),
        (Entity::User, "utm_campaign") => ("utmCampaign", Text),
        (Entity::User, "utm_content") => ("utmContent", Text),
        (Entity::User, "utm_term") => ("utmTerm", Text),

        (Entity::Session, "user_id") => ("user_id", Integer),
        (Entity::Session, "landing_page") => ("landingPage", Text),
        (Entity::Session, "referrer") => ("referrer", Text),
        (Entity::Session, "device") => ("device", Text),
        (Entity::Session, "country") => ("country", Text),
        (Entity::Session, "utm_source") => ("utm_source", Text),
        (Entity::Session, "utm_medium") => ("utm_medium", Text),
        (Entity::Session, "utm_campaign") => ("utm_campaign", Text),
        (Entity::Session, "utm_content") => ("utm_content", Text),
        (Entity::Session, "utm_term") => ("utm_term", Text),
        (Entity::Session, "profession_id") => ("profession_id", Integer),
        (Entity::Session, "product_id") => ("product_id", Integer),
        (Entity::Session, "funnel_id") => ("funnel_id", Integer),

        (Entity::Profession, "name") => ("name", Text),
        (Entity::Profession, "slug") => ("slug", Text),

        (Entity::Product, "name") => ("name", Text),
        (Entity::Product, "profession_id") => ("profession_id", Integer),
        (Entity::Product, "price") => ("price", Decimal),

        (Entity::Funnel, "name") => ("name", Text),
        (Entity::Funnel, "slug") => ("slug", Text),

        _ => return None,
    };
    Some(column)
}

const RESERVED: &[&str] = &[
    "type", "value", "user", "order", "group", "select", "from", "where", "limit", "desc",
];

/// Quote `column` when the engine would otherwise case-fold or misparse it.
pub fn quote_identifier(column: &str) -> String {
    let plain = column
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && column
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if plain && !RESERVED.contains(&column) {
        column.to_string()
    } else {
        format!("\"{}\"", column.replace('"', "\"\""))
    }
}

/// `utmSource` / `UTM_SOURCE` / `utm_source` all normalise to `utm_source`.
fn normalize_field(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 4);
    let mut prev_lower = false;
    for c in raw.trim().chars() {
        if c.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
        prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProperty {
    pub entity: Entity,
    /// Alias-qualified, quoted where needed, e.g. `u."utmSource"`.
    pub column: String,
    pub kind: ColumnKind,
    pub attribution: bool,
}

/// Resolve `entity.field` (or a bare field against `root`).
pub fn resolve_property(property: &str, root: Entity) -> Option<ResolvedProperty> {
    let (entity, field) = match property.split_once('.') {
        Some((entity, field)) => (Entity::parse(entity)?, field),
        None => (root, property),
    };
    if !entity.reachable_from(root) {
        return None;
    }
    let field = normalize_field(field);
    let (column, kind) = physical_column(entity, &field)?;
    Some(ResolvedProperty {
        entity,
        column: format!("{}.{}", entity.alias(), quote_identifier(column)),
        kind,
        attribution: field.starts_with("utm_"),
    })
}

/// A bound parameter for a `?` placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlArg {
    Text(String),
    Int(i64),
    Float(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    UnknownProperty,
    UnsupportedOperator,
    InvalidValue,
}

/// A filter that compiled to nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedFilter {
    pub id: String,
    pub property: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledFilter {
    pub sql: String,
    pub args: Vec<SqlArg>,
    pub skipped: Vec<SkippedFilter>,
}

/// Reject malformed filter payloads before anything is dispatched.
pub fn validate_filters(filters: &[AdvancedFilter]) -> EngineResult<()> {
    if filters.len() > MAX_FILTERS {
        return Err(EngineError::InvalidFilter(format!(
            "{} filters supplied (max {MAX_FILTERS})",
            filters.len()
        )));
    }
    if let Some(bad) = filters.iter().find(|f| f.property.trim().is_empty()) {
        return Err(EngineError::InvalidFilter(format!(
            "filter {:?} has an empty property",
            bad.id
        )));
    }
    Ok(())
}

/// Compiles advanced filters for queries rooted at one entity.
#[derive(Debug, Clone, Copy)]
pub struct FilterCompiler {
    root: Entity,
}

impl Default for FilterCompiler {
    fn default() -> Self {
        Self::new(Entity::Event)
    }
}

impl FilterCompiler {
    pub fn new(root: Entity) -> Self {
        Self { root }
    }

    pub fn root(&self) -> Entity {
        self.root
    }

    pub fn compile(&self, filters: &[AdvancedFilter], condition: FilterCondition) -> CompiledFilter {
        let mut predicates = Vec::with_capacity(filters.len());
        let mut compiled = CompiledFilter::default();

        for filter in filters {
            match self.render(filter) {
                Ok((predicate, arg)) => {
                    predicates.push(predicate);
                    compiled.args.push(arg);
                }
                Err(reason) => {
                    tracing::warn!(
                        filter_id = %filter.id,
                        property = %filter.property,
                        ?reason,
                        "advanced filter skipped"
                    );
                    compiled.skipped.push(SkippedFilter {
                        id: filter.id.clone(),
                        property: filter.property.clone(),
                        reason,
                    });
                }
            }
        }

        match condition {
            FilterCondition::And => {
                for predicate in &predicates {
                    compiled.sql.push_str(" AND ");
                    compiled.sql.push_str(predicate);
                }
            }
            FilterCondition::Or if !predicates.is_empty() => {
                compiled.sql.push_str(" AND (");
                compiled.sql.push_str(&predicates.join(" OR "));
                compiled.sql.push(')');
            }
            FilterCondition::Or => {}
        }
        compiled
    }

    fn render(&self, filter: &AdvancedFilter) -> Result<(String, SqlArg), SkipReason> {
        if filter.operator == FilterOperator::Unsupported {
            return Err(SkipReason::UnsupportedOperator);
        }
        let resolved =
            resolve_property(&filter.property, self.root).ok_or(SkipReason::UnknownProperty)?;
        let column = &resolved.column;
        let value = filter.value.as_str();

        // Unset attribution is stored as NULL; treat it as the empty string.
        if resolved.attribution && value.is_empty() {
            let op = match filter.operator {
                FilterOperator::Equals => "=",
                FilterOperator::NotEquals => "!=",
                _ => return Ok(like_predicate(filter.operator, column, resolved.kind, value)),
            };
            return Ok((
                format!("COALESCE({column}, '') {op} ?"),
                SqlArg::Text(String::new()),
            ));
        }

        match filter.operator {
            FilterOperator::Equals | FilterOperator::NotEquals => {
                let op = if filter.operator == FilterOperator::Equals {
                    "="
                } else {
                    "!="
                };
                let arg = typed_arg(resolved.kind, value)?;
                Ok((format!("{column} {op} ?"), arg))
            }
            FilterOperator::Contains | FilterOperator::NotContains => {
                Ok(like_predicate(filter.operator, column, resolved.kind, value))
            }
            FilterOperator::Unsupported => Err(SkipReason::UnsupportedOperator),
        }
    }
}

fn typed_arg(kind: ColumnKind, value: &str) -> Result<SqlArg, SkipReason> {
    match kind {
        ColumnKind::Integer => value
            .trim()
            .parse()
            .map(SqlArg::Int)
            .map_err(|_| SkipReason::InvalidValue),
        ColumnKind::Decimal => value
            .trim()
            .parse()
            .map(SqlArg::Float)
            .map_err(|_| SkipReason::InvalidValue),
        ColumnKind::Text | ColumnKind::Timestamp => Ok(SqlArg::Text(value.to_string())),
    }
}

fn like_predicate(
    operator: FilterOperator,
    column: &str,
    kind: ColumnKind,
    value: &str,
) -> (String, SqlArg) {
    let target = match kind {
        ColumnKind::Text => column.to_string(),
        _ => format!("CAST({column} AS VARCHAR)"),
    };
    let op = if operator == FilterOperator::NotContains {
        "NOT LIKE"
    } else {
        "LIKE"
    };
    (format!("{target} {op} ?"), SqlArg::Text(format!("%{value}%")))
}

/// Mandatory scope constraints applied outside the advanced-filter group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeFilter {
    #[serde(default)]
    pub profession_ids: Vec<i64>,
    #[serde(default)]
    pub funnel_ids: Vec<i64>,
    #[serde(default)]
    pub product_ids: Vec<i64>,
    #[serde(default)]
    pub landing_page: Option<String>,
}

impl ScopeFilter {
    pub fn is_empty(&self) -> bool {
        self.profession_ids.is_empty()
            && self.funnel_ids.is_empty()
            && self.product_ids.is_empty()
            && self.landing_page.is_none()
    }

    /// Equality / `IN` constraints on the root entity's own columns.
    pub fn compile(&self, root: Entity) -> CompiledFilter {
        let mut compiled = CompiledFilter::default();
        let alias = root.alias();
        for (column, ids) in [
            ("profession_id", &self.profession_ids),
            ("funnel_id", &self.funnel_ids),
            ("product_id", &self.product_ids),
        ] {
            if ids.is_empty() {
                continue;
            }
            let placeholders = vec!["?"; ids.len()].join(", ");
            compiled
                .sql
                .push_str(&format!(" AND {alias}.{column} IN ({placeholders})"));
            compiled.args.extend(ids.iter().copied().map(SqlArg::Int));
        }
        if let Some(ref page) = self.landing_page {
            compiled.sql.push_str(&format!(
                " AND {}.{} = ?",
                Entity::Session.alias(),
                quote_identifier("landingPage")
            ));
            compiled.args.push(SqlArg::Text(page.clone()));
        }
        compiled
    }
}
