//! Commands for plan catalog administration

use serde::Deserialize;

use super::{require, require_text};
use crate::billing::{BillingState, NewPlan, Plan, PlanUpdate};
use crate::error::ErrorResponse;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePlanRequest {
    pub name: Option<String>,
    pub features: Option<String>,
    pub price: Option<i64>,
    pub monthly_limit: Option<u32>,
    pub is_active: Option<bool>,
}

/// List all plans
pub fn list_plans(billing: &BillingState) -> Result<Vec<Plan>, ErrorResponse> {
    Ok(billing.plans.list_plans()?)
}

/// List plans available for purchase or grant
pub fn list_active_plans(billing: &BillingState) -> Result<Vec<Plan>, ErrorResponse> {
    Ok(billing.plans.list_active_plans()?)
}

pub fn get_plan(billing: &BillingState, plan_id: Option<i64>) -> Result<Plan, ErrorResponse> {
    let plan_id = require(plan_id, "planId")?;
    Ok(billing.plans.get_plan(plan_id)?)
}

/// Create a plan; a missing monthly limit means unlimited
pub fn create_plan(
    billing: &BillingState,
    request: CreatePlanRequest,
) -> Result<Plan, ErrorResponse> {
    let new = NewPlan {
        name: require_text(request.name, "name")?,
        features: require_text(request.features, "features")?,
        price: require(request.price, "price")?,
        monthly_limit: request.monthly_limit,
        is_active: request.is_active.unwrap_or(true),
    };
    Ok(billing.plans.create_plan(new)?)
}

pub fn update_plan(
    billing: &BillingState,
    plan_id: Option<i64>,
    update: PlanUpdate,
) -> Result<Plan, ErrorResponse> {
    let plan_id = require(plan_id, "planId")?;
    Ok(billing.plans.update_plan(plan_id, update)?)
}

pub fn delete_plan(billing: &BillingState, plan_id: Option<i64>) -> Result<(), ErrorResponse> {
    let plan_id = require(plan_id, "planId")?;
    Ok(billing.plans.delete_plan(plan_id)?)
}
