//! Harvest strategy: what the scout estimate means for the main run.

use crate::config;
use crate::scout::ScoutEstimate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a work item is attacked, fixed before the driver starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "expected", rename_all = "snake_case")]
pub enum Strategy {
    Skip,
    Single,
    Batch(u32),
}

/// Map a scout estimate to a strategy. `Unknown` is treated as one document.
pub fn select(estimate: ScoutEstimate) -> Strategy {
    match estimate.resolved_count() {
        0 => Strategy::Skip,
        1 => Strategy::Single,
        n => Strategy::Batch(n),
    }
}

impl Strategy {
    /// Number of new artifacts that ends the run.
    pub fn expected_count(&self) -> usize {
        match self {
            Strategy::Skip => 0,
            Strategy::Single => 1,
            Strategy::Batch(n) => *n as usize,
        }
    }

    /// `None` for `Skip`, which never runs a driver.
    pub fn step_cap(&self, caps: &StepCaps) -> Option<usize> {
        match self {
            Strategy::Skip => None,
            Strategy::Single => Some(caps.single),
            Strategy::Batch(_) => Some(caps.batch),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Skip => write!(f, "skip"),
            Strategy::Single => write!(f, "single"),
            Strategy::Batch(n) => write!(f, "batch({n})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepCaps {
    pub scout: usize,
    pub single: usize,
    pub batch: usize,
}

impl From<&config::Agent> for StepCaps {
    fn from(agent: &config::Agent) -> Self {
        Self {
            scout: agent.scout_step_cap,
            single: agent.single_step_cap,
            batch: agent.batch_step_cap,
        }
    }
}

/// Natural-language task handed to the main planner.
pub fn task_description(strategy: Strategy, url: &str, estimate: ScoutEstimate, contact: &config::Contact) -> Option<String> {
    let form = format!(
        "FOR DOWNLOAD FORMS use: Name: {}, Email: {}, Phone: {}, Company: {}. \
         For dropdowns select \"{}\" for contact type and \"{}\" for state. \
         Check any terms/conditions checkboxes.",
        contact.name, contact.email, contact.phone, contact.company, contact.contact_type, contact.state
    );
    let scouted = match estimate {
        ScoutEstimate::Count(n) => format!("A scout counted {n} document download button(s) on this page."),
        ScoutEstimate::Unknown => "A scout could not count the download buttons; assume there is one.".to_string(),
    };

    let body = match strategy {
        Strategy::Skip => return None,
        Strategy::Single => format!(
            "Download the offering memorandum (OM) from the property page {url}, which is already open.\n\
             {scouted}\n\
             1. Find the button or link that gets the OM, brochure, flyer or marketing package and click it.\n\
             2. If a form appears, fill it in and submit it. After submitting, look for NEW download buttons and click the final one.\n\
             3. If the PDF opens in a new tab, use capture_pdf_tab. If you see a direct PDF link, use download_pdf.\n\
             4. Use declare_done right after the final download click or capture."
        ),
        Strategy::Batch(n) => format!(
            "Download ALL {n} offering memorandum documents from {url}, which is already open.\n\
             {scouted}\n\
             1. Work through the download buttons one at a time. Never click a button you already clicked.\n\
             2. Fill and submit any form that appears; fill the same details each time it reappears.\n\
             3. If a PDF opens in a new tab, use capture_pdf_tab, then close that tab and switch back to the listing.\n\
             4. Use declare_done once every document was downloaded or no download buttons remain."
        ),
    };
    Some(format!("{body}\n\n{form}"))
}
