//! Prompt construction for the agents a pipeline dispatches.
//!
//! Every prompt names the exact artifact it must produce, because the
//! pipeline checks for those artifacts after the agent exits (structural
//! failure otherwise). Paths are always relative to the worktree the agent
//! runs in.

use std::path::{Path, PathBuf};

use crate::progress::{Phase, Plan};

/// Per-run artifact directory inside the worktree.
pub fn delivery_dir(slug: &str) -> PathBuf {
    PathBuf::from(".delivery").join(slug)
}

pub fn prd_path(slug: &str) -> PathBuf {
    delivery_dir(slug).join("prd.md")
}

pub fn progress_path(slug: &str) -> PathBuf {
    delivery_dir(slug).join("progress.json")
}

/// Running notes handed from each worker to the next task in the pipeline.
pub fn notes_path(slug: &str) -> PathBuf {
    delivery_dir(slug).join("notes.md")
}

pub fn postmortem_path(slug: &str) -> PathBuf {
    delivery_dir(slug).join("postmortem.md")
}

/// Product-manager prompt: turn the operator's request into a PRD.
pub fn prd_prompt(project_name: &str, request: &str, slug: &str) -> String {
    let prd = prd_path(slug);
    format!(
        "You are the product manager for the project `{project}`. Turn the \
         request below into a product requirements document.\n\n\
         # Request\n{request}\n\n\
         # Instructions\n\
         - Study the existing codebase before writing anything.\n\
         - Describe the goal, the user-visible behavior, acceptance criteria, \
         and explicit non-goals.\n\
         - Keep it scoped to what one feature branch can deliver.\n\
         - Write the document to `{prd}` and nothing else. Do not modify any \
         source files.",
        project = project_name,
        request = request,
        prd = prd.display(),
    )
}

/// Engineering-manager prompt: decompose the PRD into a phased plan.
///
/// The JSON contract is spelled out verbatim because the orchestrator parses
/// the file structurally and halts on any deviation.
pub fn decomposition_prompt(slug: &str, workers_per_phase: usize) -> String {
    let prd = prd_path(slug);
    let progress = progress_path(slug);
    let assignment_note = if workers_per_phase > 1 {
        "Each phase has exactly two assignments (roles `engineer` and \
         `engineer-2`) with non-overlapping sections; split by file ownership \
         so the two workers rarely touch the same files."
    } else {
        "Each phase has exactly one assignment with role `engineer`."
    };
    format!(
        "You are the engineering manager. Read the PRD at `{prd}` and break \
         the work into sequential phases.\n\n\
         # Instructions\n\
         - 2 to 5 phases. Each phase must leave the project compiling and \
         tested; later phases build on earlier ones.\n\
         - {assignment_note}\n\
         - Every assignment contains sections, each with a short title and \
         concrete todo items.\n\
         - Write ONLY the JSON document below to `{progress}`. Do not modify \
         any source files.\n\n\
         # Required JSON shape\n\
         ```json\n\
         {{\n\
           \"slug\": \"{slug}\",\n\
           \"status\": \"pending\",\n\
           \"current_phase\": 0,\n\
           \"phases\": [\n\
             {{\n\
               \"number\": 1,\n\
               \"name\": \"<phase name>\",\n\
               \"status\": \"pending\",\n\
               \"assignments\": [\n\
                 {{\n\
                   \"role\": \"engineer\",\n\
                   \"status\": \"pending\",\n\
                   \"sections\": [\n\
                     {{\n\
                       \"title\": \"<section title>\",\n\
                       \"todos\": [\n\
                         {{\"description\": \"<todo>\", \"done\": false}}\n\
                       ]\n\
                     }}\n\
                   ]\n\
                 }}\n\
               ],\n\
               \"review\": {{\"status\": \"pending\"}}\n\
             }}\n\
           ]\n\
         }}\n\
         ```",
        prd = prd.display(),
        progress = progress.display(),
        assignment_note = assignment_note,
        slug = slug,
    )
}

/// Worker prompt for one assignment of the current phase.
pub fn phase_worker_prompt(
    plan: &Plan,
    phase: &Phase,
    assignment_idx: usize,
    notes: Option<&str>,
) -> String {
    let assignment = &phase.assignments[assignment_idx];
    let notes_file = notes_path(&plan.slug);

    let mut scope = String::new();
    for section in &assignment.sections {
        scope.push_str(&format!("\n## {}\n", section.title));
        for todo in &section.todos {
            scope.push_str(&format!("- [ ] {}\n", todo.description));
        }
    }
    if scope.is_empty() {
        scope.push_str("\n(see the PRD for this phase's scope)\n");
    }

    let notes_block = match notes {
        Some(n) if !n.trim().is_empty() => {
            format!("\n# Notes from earlier work\n{}\n", n.trim())
        }
        _ => String::new(),
    };

    format!(
        "You are the `{role}` for phase {number} ({name}) of the delivery \
         `{slug}`. Implement exactly the scope below.\n\
         {scope}{notes}\n\
         # Instructions\n\
         - The PRD is at `{prd}` for context; your scope above is binding.\n\
         - Work only on files your scope covers. Other assignments run in \
         parallel worktrees.\n\
         - Run the project's tests for everything you change.\n\
         - Commit your work in small, well-described commits. Leave the tree \
         clean when you finish.\n\
         - Append anything the next task needs to know (decisions, gotchas, \
         follow-ups) to `{notes_file}`.",
        role = assignment.role,
        number = phase.number,
        name = phase.name,
        slug = plan.slug,
        scope = scope,
        notes = notes_block,
        prd = prd_path(&plan.slug).display(),
        notes_file = notes_file.display(),
    )
}

/// Reviewer prompt gating a finished phase. Conflict file names from the
/// phase merge are included so the reviewer resolves them before approving.
pub fn review_prompt(plan: &Plan, phase: &Phase, conflicts: &[String], notes: Option<&str>) -> String {
    let mut summary = String::new();
    for assignment in &phase.assignments {
        summary.push_str(&format!("- `{}`:", assignment.role));
        let titles: Vec<&str> = assignment
            .sections
            .iter()
            .map(|s| s.title.as_str())
            .collect();
        if titles.is_empty() {
            summary.push_str(" (unscoped)\n");
        } else {
            summary.push_str(&format!(" {}\n", titles.join(", ")));
        }
    }

    let conflict_block = if conflicts.is_empty() {
        String::new()
    } else {
        let mut block = String::from(
            "\n# Merge conflicts\nThe worker branches merged with unresolved \
             conflict markers in these files. Resolve every one of them \
             before anything else:\n",
        );
        for file in conflicts {
            block.push_str(&format!("- `{}`\n", file));
        }
        block
    };

    let notes_block = match notes {
        Some(n) if !n.trim().is_empty() => {
            format!("\n# Notes from the workers\n{}\n", n.trim())
        }
        _ => String::new(),
    };

    format!(
        "You are reviewing phase {number} ({name}) of the delivery `{slug}`.\n\n\
         # What was implemented\n{summary}{conflicts}{notes}\n\
         # Instructions\n\
         - Check the implementation against the PRD at `{prd}` and this \
         phase's scope.\n\
         - Build the project and run the full test suite. Fix what is broken.\n\
         - Tighten anything sloppy, then commit your fixes.\n\
         - Exit successfully only if the phase is genuinely done; otherwise \
         exit with a nonzero status.",
        number = phase.number,
        name = phase.name,
        slug = plan.slug,
        summary = summary,
        conflicts = conflict_block,
        notes = notes_block,
        prd = prd_path(&plan.slug).display(),
    )
}

/// Post-mortem prompt closing out a finished delivery: a short retrospective
/// written from the run's own artifacts, committed alongside them.
pub fn postmortem_prompt(project_name: &str, slug: &str) -> String {
    let prd = prd_path(slug);
    let progress = progress_path(slug);
    let notes = notes_path(slug);
    let postmortem = postmortem_path(slug);
    format!(
        "The delivery `{slug}` for the project `{project}` has just finished. \
         Write a short post-mortem of the run.\n\n\
         # Instructions\n\
         - Read the PRD at `{prd}`, the phase plan at `{progress}`, the \
         running notes at `{notes}` (if present), and the git log of this \
         branch.\n\
         - Summarize what was delivered, what deviated from the plan, and any \
         follow-ups the notes or the code point at.\n\
         - Keep it under a page.\n\
         - Write the document to `{postmortem}` and nothing else. Do not \
         modify any source files.",
        slug = slug,
        project = project_name,
        prd = prd.display(),
        progress = progress.display(),
        notes = notes.display(),
        postmortem = postmortem.display(),
    )
}

/// Best-effort read of the running notes file from a worktree.
pub fn read_notes(workdir: &Path, slug: &str) -> Option<String> {
    std::fs::read_to_string(workdir.join(notes_path(slug))).ok()
}
