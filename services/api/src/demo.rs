use crate::infra::{build_clearance_service, default_departments, MemoryClearanceService};
use clap::Args;
use clearance::config::ClearanceConfig;
use clearance::error::AppError;
use clearance::workflows::clearance::{
    ActorId, ApplicantFacts, ApplicationId, ApplicationState, Decision, DecisionInput,
    DepartmentName, FixedWindowRateLimiter, ReapplyRequest, ReapplyTarget, SystemClock,
    VerificationFailure,
};
use std::sync::Arc;

#[derive(Args, Debug)]
pub(crate) struct DemoArgs {
    /// Registration number of the demo student.
    #[arg(long, default_value = "CS21-042")]
    pub(crate) registration_no: String,
    /// Department that rejects first and is then reapplied to.
    #[arg(long, default_value = "hostel")]
    pub(crate) rejecting_department: String,
    /// Print the final public status payload as JSON.
    #[arg(long)]
    pub(crate) show_status: bool,
}

#[derive(Args, Debug)]
pub(crate) struct VerifyArgs {
    /// QR payload exactly as scanned (JSON text).
    #[arg(long)]
    pub(crate) payload: String,
}

pub(crate) fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let DemoArgs {
        registration_no,
        rejecting_department,
        show_status,
    } = args;

    let config = ClearanceConfig::default();
    let clock = Arc::new(SystemClock);
    let limiter = Arc::new(FixedWindowRateLimiter::new(clock.clone()));
    let (service, notifier) = build_clearance_service(&config, limiter, clock);

    let departments = default_departments();
    let rejecting = DepartmentName::new(rejecting_department.trim());
    if !departments.contains(&rejecting) {
        println!(
            "Unknown department '{}'; choose one of: {}",
            rejecting,
            departments
                .iter()
                .map(|department| department.0.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        return Ok(());
    }

    println!("No-dues clearance demo");
    let application =
        service.open_application(demo_applicant(&registration_no), departments.clone())?;
    let id = application.id.clone();
    println!(
        "- Opened application {} for {} -> {} ({} departments)",
        id,
        application.facts.registration_no,
        application.state,
        application.departments.len()
    );

    let first_approver = departments
        .iter()
        .find(|department| **department != rejecting)
        .cloned();
    if let Some(department) = &first_approver {
        let state =
            service.record_decision(&id, &decision(department, Decision::Approved, None))?;
        println!("- {} approves -> {}", department, state);
    }

    let state = service.record_decision(
        &id,
        &decision(&rejecting, Decision::Rejected, Some("missing item")),
    )?;
    println!("- {} rejects (missing item) -> {}", rejecting, state);

    let result = service.reapply(
        &id,
        &ReapplyRequest {
            target: ReapplyTarget::Department(rejecting.clone()),
            reason: "returned the missing item".to_string(),
            edited_fields: Default::default(),
            actor_scope: registration_no.clone(),
        },
    )?;
    println!(
        "- Student reapplies to {} -> {} (reapplication #{})",
        rejecting, result.state, result.reapplication_count
    );

    let mut final_state = result.state;
    for department in departments
        .iter()
        .filter(|department| Some(*department) != first_approver.as_ref())
    {
        final_state =
            service.record_decision(&id, &decision(department, Decision::Approved, None))?;
        println!("- {} approves -> {}", department, final_state);
    }

    if final_state != ApplicationState::Completed {
        println!("  Application did not complete; no certificate issued");
        return Ok(());
    }

    let Some(record) = service.certificate(&id)? else {
        println!("  Completed without a certificate record");
        return Ok(());
    };
    println!(
        "- Certificate secured: tx {} | block {} | hash {}",
        record.transaction_id, record.block_number, record.hash
    );

    let payload = service.presentation_payload(&id)?;
    let qr_data = serde_json::to_string(&payload)?;
    println!("  QR payload: {}", qr_data);

    let verdict = service.verify_encoded(&qr_data)?;
    println!(
        "- Verification: {} ({})",
        if verdict.valid { "valid" } else { "invalid" },
        verdict.message
    );

    let events = notifier.events();
    if events.is_empty() {
        println!("  Notifications: none dispatched");
    } else {
        println!("  Notifications:");
        for notice in events {
            println!(
                "    - template={} -> {}",
                notice.template, notice.application_id
            );
        }
    }

    if show_status {
        print_status(&service, &id)?;
    }

    Ok(())
}

/// Decodes a QR payload and reports whether it is structurally a certificate payload.
pub(crate) fn run_verify(args: VerifyArgs) -> Result<(), AppError> {
    let config = ClearanceConfig::default();
    let clock = Arc::new(SystemClock);
    let limiter = Arc::new(FixedWindowRateLimiter::new(clock.clone()));
    let (service, _) = build_clearance_service(&config, limiter, clock);

    let verdict = service.verify_encoded(&args.payload)?;
    match verdict.reason {
        Some(VerificationFailure::Malformed) => {
            println!("Malformed payload: {}", verdict.message);
        }
        _ => {
            println!("Payload is structurally valid");
            println!("  Integrity can only be confirmed by the issuing service's records");
        }
    }
    Ok(())
}

fn print_status(service: &MemoryClearanceService, id: &ApplicationId) -> Result<(), AppError> {
    let view = service.application(id)?.status_view();
    println!(
        "  Public status payload:\n{}",
        serde_json::to_string_pretty(&view)?
    );
    Ok(())
}

fn decision(
    department: &DepartmentName,
    decision: Decision,
    reason: Option<&str>,
) -> DecisionInput {
    DecisionInput {
        department: department.clone(),
        decision,
        actor: ActorId(format!("{department}-desk")),
        reason: reason.map(str::to_string),
        remarks: None,
    }
}

fn demo_applicant(registration_no: &str) -> ApplicantFacts {
    ApplicantFacts {
        identity_id: format!("demo-{}", registration_no.to_ascii_lowercase()),
        registration_no: registration_no.to_string(),
        full_name: "Priya Nair".to_string(),
        parent_name: Some("Suresh Nair".to_string()),
        school: "School of Engineering".to_string(),
        course: "B.Tech".to_string(),
        branch: "Computer Science".to_string(),
        admission_year: Some("2021".to_string()),
        passing_year: Some("2025".to_string()),
        country_code: Some("+91".to_string()),
        contact_no: None,
        personal_email: None,
        college_email: None,
    }
}
