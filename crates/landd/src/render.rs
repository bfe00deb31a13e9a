//! Terminal output for the landd admin commands.

use land_core::{Event, LandingJob};

/// Print confirmation after submitting a job.
pub fn print_job_created(job: &LandingJob) {
    println!("Submitted job: {}", job.id);
    println!("  Repo:      {}", job.target_repo);
    println!("  Requester: {}", job.requester_email);
    println!("  Priority:  {}", job.priority);
    println!("  Revisions: {}", job.revisions.len());
}

/// Print jobs in tabular format.
pub fn print_job_list(jobs: &[LandingJob]) {
    if jobs.is_empty() {
        println!("No jobs found.");
        return;
    }

    println!(
        "{:<36}  {:<16}  {:<11}  {:>3}  {:<24}  {:<19}",
        "ID", "REPO", "STATUS", "TRY", "REQUESTER", "CREATED"
    );
    println!("{}", "-".repeat(120));

    for job in jobs {
        println!(
            "{:<36}  {:<16}  {:<11}  {:>3}  {:<24}  {:<19}",
            job.id.0,
            truncate(&job.target_repo, 16),
            job.status.as_str(),
            job.attempts,
            truncate(&job.requester_email, 24),
            format_time(&job.created_at),
        );
    }

    println!();
    println!("{} job(s)", jobs.len());
}

/// Print one job with its stack and audit trail.
pub fn print_job_details(job: &LandingJob, events: &[Event]) {
    println!("Job: {}", job.id);
    println!();
    println!("  Repo:       {}", job.target_repo);
    println!("  Status:     {}", job.status);
    println!("  Requester:  {}", job.requester_email);
    println!("  Priority:   {}", job.priority);
    println!("  Attempts:   {}", job.attempts);
    println!("  Created:    {}", format_time(&job.created_at));
    println!("  Updated:    {}", format_time(&job.updated_at));
    if let Some(ref commit) = job.landed_commit_id {
        println!("  Landed:     {commit}");
    }
    for (before, after) in &job.formatted_replacements {
        println!("  Formatted:  {before} -> {after}");
    }
    if let Some(ref error) = job.error {
        println!("  Error:");
        for line in error.lines() {
            println!("    {line}");
        }
    }
    if let Some(ref breakdown) = job.error_breakdown {
        println!("  Failed paths:");
        for failed in &breakdown.failed_paths {
            let reject = breakdown
                .rejects_paths
                .get(&failed.path)
                .map_or("", |r| r.path.as_str());
            println!("    {}  ({})", failed.path, reject);
        }
    }

    println!();
    println!("Revisions:");
    for (index, revision) in job.revisions.iter().enumerate() {
        println!(
            "  {:>2}. {:<36}  {:<10}  {}",
            index,
            revision.id.0,
            revision.label(),
            revision.commit_id.as_deref().unwrap_or("-")
        );
    }

    if !events.is_empty() {
        println!();
        println!("Events:");
        for event in events {
            println!(
                "  {}  {:<20}  {}",
                format_time(&event.timestamp),
                event.event_type,
                event.payload_json
            );
        }
    }
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
