use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;

use leadpulse_core::{
    engine::DashboardRequest,
    filter::{AdvancedFilter, FilterCondition, ScopeFilter},
    period::{parse_clock, DatePeriod},
    query::Measure,
};

use crate::{error::AppError, state::AppState};

/// JSON body shared by every dashboard endpoint.
///
/// Dates are civil dates in the configured reference timezone. `time_from` /
/// `time_to` (`HH:MM`) restrict every day of the range.
#[derive(Debug, Default, Deserialize)]
pub struct DashboardBody {
    pub start_date: String,
    pub end_date: String,
    pub time_from: Option<String>,
    pub time_to: Option<String>,
    pub previous_start_date: Option<String>,
    pub previous_end_date: Option<String>,
    #[serde(default)]
    pub filters: Vec<AdvancedFilter>,
    pub filter_condition: Option<FilterCondition>,
    #[serde(default)]
    pub profession_ids: Vec<i64>,
    #[serde(default)]
    pub funnel_ids: Vec<i64>,
    #[serde(default)]
    pub product_ids: Vec<i64>,
    pub landing_page: Option<String>,
}

fn parse_date(raw: &str, field: &'static str) -> Result<NaiveDate, AppError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| AppError::InvalidField {
        field,
        message: format!("invalid {field} (expected YYYY-MM-DD)"),
    })
}

fn parse_time(raw: Option<&str>, field: &'static str) -> Result<Option<chrono::NaiveTime>, AppError> {
    raw.filter(|r| !r.trim().is_empty())
        .map(|r| {
            parse_clock(r).map_err(|e| AppError::InvalidField {
                field,
                message: e.to_string(),
            })
        })
        .transpose()
}

impl DashboardBody {
    fn period(
        &self,
        start: &str,
        start_field: &'static str,
        end: &str,
        end_field: &'static str,
    ) -> Result<DatePeriod, AppError> {
        let period = DatePeriod::from_dates(parse_date(start, start_field)?, parse_date(end, end_field)?)
            .map_err(|e| AppError::BadRequest(e.to_string()))?;
        period
            .with_time_window(
                parse_time(self.time_from.as_deref(), "time_from")?,
                parse_time(self.time_to.as_deref(), "time_to")?,
            )
            .map_err(|e| AppError::BadRequest(e.to_string()))
    }

    /// Decode into an engine request. The explicit previous period needs both
    /// of its dates or neither.
    pub fn into_request(self) -> Result<DashboardRequest, AppError> {
        let current = self.period(&self.start_date, "start_date", &self.end_date, "end_date")?;
        let previous = match (&self.previous_start_date, &self.previous_end_date) {
            (Some(start), Some(end)) => Some(self.period(
                start,
                "previous_start_date",
                end,
                "previous_end_date",
            )?),
            (None, None) => None,
            _ => {
                return Err(AppError::BadRequest(
                    "previous_start_date and previous_end_date must be given together".to_string(),
                ))
            }
        };

        let mut request = DashboardRequest::new(current)
            .with_filters(self.filters, self.filter_condition.unwrap_or_default())
            .with_scope(ScopeFilter {
                profession_ids: self.profession_ids,
                funnel_ids: self.funnel_ids,
                product_ids: self.product_ids,
                landing_page: self.landing_page.filter(|p| !p.is_empty()),
            });
        request.previous = previous;
        Ok(request)
    }
}

async fn compare_measure(
    state: &AppState,
    measure: Measure,
    body: DashboardBody,
) -> Result<impl IntoResponse, AppError> {
    let request = body.into_request()?;
    let result = state.engine.compare(measure, &request).await?;
    Ok(Json(json!({ "data": result })))
}

/// `POST /api/dashboard/sessions`
#[tracing::instrument(skip_all, fields(request_id = %uuid::Uuid::new_v4()))]
pub async fn sessions(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DashboardBody>,
) -> Result<impl IntoResponse, AppError> {
    compare_measure(&state, Measure::Sessions, body).await
}

/// `POST /api/dashboard/leads`
#[tracing::instrument(skip_all, fields(request_id = %uuid::Uuid::new_v4()))]
pub async fn leads(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DashboardBody>,
) -> Result<impl IntoResponse, AppError> {
    compare_measure(&state, Measure::LEADS, body).await
}

/// `POST /api/dashboard/purchases`
#[tracing::instrument(skip_all, fields(request_id = %uuid::Uuid::new_v4()))]
pub async fn purchases(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DashboardBody>,
) -> Result<impl IntoResponse, AppError> {
    compare_measure(&state, Measure::PURCHASES, body).await
}

/// `POST /api/dashboard/survey-responses`
#[tracing::instrument(skip_all, fields(request_id = %uuid::Uuid::new_v4()))]
pub async fn survey_responses(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DashboardBody>,
) -> Result<impl IntoResponse, AppError> {
    compare_measure(&state, Measure::SURVEY_RESPONSES, body).await
}

/// `POST /api/dashboard/conversion`: sessions, leads and conversion rate.
#[tracing::instrument(skip_all, fields(request_id = %uuid::Uuid::new_v4()))]
pub async fn conversion(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DashboardBody>,
) -> Result<impl IntoResponse, AppError> {
    let request = body.into_request()?;
    let overview = state.engine.conversion_overview(&request).await?;
    Ok(Json(json!({ "data": overview })))
}

/// `POST /api/dashboard/revenue`
#[tracing::instrument(skip_all, fields(request_id = %uuid::Uuid::new_v4()))]
pub async fn revenue(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DashboardBody>,
) -> Result<impl IntoResponse, AppError> {
    let request = body.into_request()?;
    let summary = state.engine.revenue_summary(&request).await?;
    Ok(Json(json!({ "data": summary })))
}

/// `POST /api/dashboard/revenue/professions`
///
/// `profession_ids` selects the breakdown entities; the general summary is
/// computed without a profession constraint.
#[tracing::instrument(skip_all, fields(request_id = %uuid::Uuid::new_v4()))]
pub async fn revenue_by_profession(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DashboardBody>,
) -> Result<impl IntoResponse, AppError> {
    let mut request = body.into_request()?;
    let ids = std::mem::take(&mut request.scope.profession_ids);
    if ids.is_empty() {
        return Err(AppError::InvalidField {
            field: "profession_ids",
            message: "at least one profession id is required".to_string(),
        });
    }
    let breakdown = state.engine.revenue_by_profession(&request, &ids).await?;
    Ok(Json(json!({ "data": breakdown })))
}
