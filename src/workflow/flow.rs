//! Google console provisioning steps
//!
//! Sign in, create a project, enable the target API, mint an API key.
//! Selectors and step sequences are coupled to accounts.google.com and
//! console.cloud.google.com markup and drift when the site changes.

use std::time::{Duration, Instant};

use chromiumoxide::{Element, Page};
use rand::Rng;
use tracing::{debug, info, warn};

use super::{BrowserWorkflowConfig, CredentialArtifact, WorkflowError};
use crate::accounts::AccountRecord;

/// Console/login selectors
mod selectors {
    pub const EMAIL_INPUT: &str = "input[type='email']";
    pub const EMAIL_NEXT: &str = "#identifierNext button, #identifierNext";
    pub const PASSWORD_INPUT: &str = "input[type='password']";
    pub const PASSWORD_NEXT: &str = "#passwordNext button, #passwordNext";
    pub const PROJECT_NAME_INPUT: &str = "#p6ntest-name-input, input[formcontrolname='name']";
    pub const CREATE_PROJECT_BUTTON: &str = "button[type='submit']";
    pub const ENABLE_API_BUTTON: &str = "button[aria-label*='Enable'], .mdc-button--unelevated";
    pub const CREATE_CREDENTIALS_BUTTON: &str =
        "button[aria-label*='Create credentials'], #create-credentials-button";
    pub const API_KEY_MENU_ITEM: &str = "button[aria-label*='API key'], .mat-mdc-menu-item";
}

const LOGIN_URL: &str = "https://accounts.google.com/signin/v2/identifier";
const PROJECT_CREATE_URL: &str = "https://console.cloud.google.com/projectcreate";

/// Run the full provisioning sequence for one account on one page.
pub async fn provision(
    page: &Page,
    account: &AccountRecord,
    config: &BrowserWorkflowConfig,
) -> Result<CredentialArtifact, WorkflowError> {
    let step = Duration::from_secs(config.step_timeout_secs);

    login(page, account, step).await?;
    let project_id = create_project(page, step).await?;
    enable_api(page, &project_id, &config.target_api, step).await?;
    let api_key = create_api_key(page, &project_id, step).await?;

    Ok(CredentialArtifact {
        email: account.email.clone(),
        project_id,
        api_key,
        created_at: chrono::Utc::now(),
    })
}

/// Sign the account in
async fn login(
    page: &Page,
    account: &AccountRecord,
    step: Duration,
) -> Result<(), WorkflowError> {
    info!("Signing in as {}", account.email);

    goto(page, LOGIN_URL).await?;

    if let Some(reason) = check_blocked(page).await? {
        return Err(WorkflowError::UnexpectedState(format!(
            "blocked on login page: {}",
            reason
        )));
    }

    let email_input = wait_for_element(page, selectors::EMAIL_INPUT, step).await?;
    type_into(&email_input, &account.email).await?;
    click(page, selectors::EMAIL_NEXT).await?;

    let password_input = wait_for_element(page, selectors::PASSWORD_INPUT, step).await?;
    human_delay(400, 400).await;
    type_into(&password_input, &account.password).await?;
    click(page, selectors::PASSWORD_NEXT).await?;

    // Sign-in settles through one or more redirects
    human_delay(2500, 1500).await;

    if let Some(reason) = check_blocked(page).await? {
        return Err(WorkflowError::UnexpectedState(format!(
            "blocked after password submit: {}",
            reason
        )));
    }

    let deadline = Instant::now() + step;
    loop {
        if is_logged_in(page).await? {
            info!("Signed in as {}", account.email);
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(WorkflowError::UnexpectedState(
                "sign-in did not complete (verification challenge likely)".to_string(),
            ));
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

/// Create a fresh project and return its id
async fn create_project(page: &Page, step: Duration) -> Result<String, WorkflowError> {
    let project_name = generate_project_name();
    info!("Creating project {}", project_name);

    goto(page, PROJECT_CREATE_URL).await?;

    let name_input = wait_for_element(page, selectors::PROJECT_NAME_INPUT, step).await?;
    clear_input(page, selectors::PROJECT_NAME_INPUT).await?;
    type_into(&name_input, &project_name).await?;
    human_delay(600, 400).await;
    click(page, selectors::CREATE_PROJECT_BUTTON).await?;

    // The console redirects to the dashboard with ?project=<id> once the
    // create operation lands.
    let deadline = Instant::now() + step * 2;
    loop {
        if let Some(id) = current_project_id(page).await? {
            info!("Project created: {}", id);
            return Ok(id);
        }
        if Instant::now() >= deadline {
            return Err(WorkflowError::UnexpectedState(
                "project creation did not complete".to_string(),
            ));
        }
        tokio::time::sleep(Duration::from_millis(1000)).await;
    }
}

/// Enable the target API on the project
async fn enable_api(
    page: &Page,
    project_id: &str,
    api: &str,
    step: Duration,
) -> Result<(), WorkflowError> {
    info!("Enabling {} on {}", api, project_id);

    let url = format!(
        "https://console.cloud.google.com/apis/library/{}?project={}",
        api, project_id
    );
    goto(page, &url).await?;

    let enable = wait_for_element(page, selectors::ENABLE_API_BUTTON, step).await?;
    enable
        .click()
        .await
        .map_err(|e| WorkflowError::Browser(e.to_string()))?;

    // Enabled state is reached when the page swaps the button for "Manage"
    let deadline = Instant::now() + step * 2;
    loop {
        let enabled = eval_bool(
            page,
            r#"(function() {
                const text = document.body ? document.body.innerText : '';
                return text.includes('API enabled') || text.includes('Manage');
            })()"#,
        )
        .await?;
        if enabled {
            info!("{} enabled on {}", api, project_id);
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(WorkflowError::UnexpectedState(format!(
                "{} did not reach enabled state",
                api
            )));
        }
        tokio::time::sleep(Duration::from_millis(1000)).await;
    }
}

/// Mint an API key and read it out of the creation dialog
async fn create_api_key(
    page: &Page,
    project_id: &str,
    step: Duration,
) -> Result<String, WorkflowError> {
    info!("Creating API key on {}", project_id);

    let url = format!(
        "https://console.cloud.google.com/apis/credentials?project={}",
        project_id
    );
    goto(page, &url).await?;

    click_when_present(page, selectors::CREATE_CREDENTIALS_BUTTON, step).await?;
    human_delay(500, 300).await;
    click_when_present(page, selectors::API_KEY_MENU_ITEM, step).await?;

    // The key shows up in a readonly input inside the overlay dialog
    let deadline = Instant::now() + step;
    loop {
        let key = eval_string(
            page,
            r#"(function() {
                const inputs = document.querySelectorAll('.cdk-overlay-container input');
                for (const input of inputs) {
                    if (input.value && input.value.startsWith('AIza')) {
                        return input.value;
                    }
                }
                return '';
            })()"#,
        )
        .await?;
        if !key.is_empty() {
            info!("API key created on {}", project_id);
            return Ok(key);
        }
        if Instant::now() >= deadline {
            return Err(WorkflowError::ElementNotFound(
                "API key dialog value".to_string(),
            ));
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

// ========== Page-state checks ==========

/// Detect challenge/CAPTCHA/rejection states that no amount of clicking
/// recovers from. Returns the block type when blocked.
async fn check_blocked(page: &Page) -> Result<Option<String>, WorkflowError> {
    let result = eval_string(
        page,
        r#"(function() {
            const url = window.location.href || '';
            const bodyText = document.body ? document.body.innerText : '';

            if (url.includes('/challenge/') || url.includes('/signin/rejected')) {
                return 'verification_challenge';
            }
            if (url.includes('/sorry/') || document.querySelector('iframe[src*="recaptcha"]')) {
                return 'captcha';
            }
            if (bodyText.includes('unusual traffic') || bodyText.includes('automated queries')) {
                return 'unusual_traffic';
            }
            if (bodyText.includes("Couldn't sign you in") ||
                bodyText.includes('This browser or app may not be secure')) {
                return 'browser_rejected';
            }
            return '';
        })()"#,
    )
    .await?;

    if result.is_empty() {
        Ok(None)
    } else {
        warn!("Blocked page state detected: {}", result);
        Ok(Some(result))
    }
}

/// Strict sign-in check: account chip or an accounts.google.com session
async fn is_logged_in(page: &Page) -> Result<bool, WorkflowError> {
    eval_bool(
        page,
        r#"(function() {
            const url = window.location.href || '';
            if (url.startsWith('https://myaccount.google.com')) {
                return true;
            }
            const chip = document.querySelector('a[aria-label*="Google Account"]') ||
                         document.querySelector('a[href*="SignOutOptions"]');
            return chip !== null;
        })()"#,
    )
    .await
}

/// Read the active project id from the console URL, if present
async fn current_project_id(page: &Page) -> Result<Option<String>, WorkflowError> {
    let id = eval_string(
        page,
        r#"(function() {
            const params = new URLSearchParams(window.location.search);
            return params.get('project') || '';
        })()"#,
    )
    .await?;

    Ok(if id.is_empty() { None } else { Some(id) })
}

// ========== Interaction helpers ==========

async fn goto(page: &Page, url: &str) -> Result<(), WorkflowError> {
    debug!("Navigating to {}", url);
    page.goto(url)
        .await
        .map_err(|e| WorkflowError::Browser(format!("navigation to {} failed: {}", url, e)))?;
    let _ = page.wait_for_navigation().await;
    Ok(())
}

/// Poll for an element until it appears or the deadline passes
async fn wait_for_element(
    page: &Page,
    selector: &str,
    timeout: Duration,
) -> Result<Element, WorkflowError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(element) = page.find_element(selector).await {
            return Ok(element);
        }
        if Instant::now() >= deadline {
            return Err(WorkflowError::ElementNotFound(selector.to_string()));
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

async fn click(page: &Page, selector: &str) -> Result<(), WorkflowError> {
    let element = page
        .find_element(selector)
        .await
        .map_err(|e| WorkflowError::ElementNotFound(format!("{}: {}", selector, e)))?;
    element
        .click()
        .await
        .map_err(|e| WorkflowError::Browser(e.to_string()))?;
    Ok(())
}

async fn click_when_present(
    page: &Page,
    selector: &str,
    timeout: Duration,
) -> Result<(), WorkflowError> {
    let element = wait_for_element(page, selector, timeout).await?;
    element
        .click()
        .await
        .map_err(|e| WorkflowError::Browser(e.to_string()))?;
    Ok(())
}

/// Type text with human-like per-character delays
async fn type_into(element: &Element, text: &str) -> Result<(), WorkflowError> {
    element
        .click()
        .await
        .map_err(|e| WorkflowError::Browser(e.to_string()))?;

    for c in text.chars() {
        element
            .type_str(c.to_string())
            .await
            .map_err(|e| WorkflowError::Browser(e.to_string()))?;
        let delay = rand::thread_rng().gen_range(50..150);
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    Ok(())
}

async fn clear_input(page: &Page, selector: &str) -> Result<(), WorkflowError> {
    let script = format!(
        r#"(function() {{
            const el = document.querySelector("{}");
            if (el) {{ el.value = ''; }}
            return true;
        }})()"#,
        selector.replace('"', "'")
    );
    eval_bool(page, &script).await?;
    Ok(())
}

/// Sleep for base plus up to `variance` extra milliseconds
async fn human_delay(base_ms: u64, variance_ms: u64) {
    let jitter = if variance_ms > 0 {
        rand::thread_rng().gen_range(0..variance_ms)
    } else {
        0
    };
    tokio::time::sleep(Duration::from_millis(base_ms + jitter)).await;
}

fn generate_project_name() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| {
            let chars = b"abcdefghijklmnopqrstuvwxyz0123456789";
            chars[rng.gen_range(0..chars.len())] as char
        })
        .collect();
    format!("autoproj-{}", suffix)
}

async fn eval_bool(page: &Page, script: &str) -> Result<bool, WorkflowError> {
    let result = page
        .evaluate(script)
        .await
        .map_err(|e| WorkflowError::Browser(format!("evaluate failed: {}", e)))?;
    result
        .into_value::<bool>()
        .map_err(|e| WorkflowError::Browser(format!("unexpected evaluate result: {}", e)))
}

async fn eval_string(page: &Page, script: &str) -> Result<String, WorkflowError> {
    let result = page
        .evaluate(script)
        .await
        .map_err(|e| WorkflowError::Browser(format!("evaluate failed: {}", e)))?;
    result
        .into_value::<String>()
        .map_err(|e| WorkflowError::Browser(format!("unexpected evaluate result: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_names_are_valid_and_distinct() {
        let a = generate_project_name();
        let b = generate_project_name();
        assert!(a.starts_with("autoproj-"));
        assert_eq!(a.len(), "autoproj-".len() + 6);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        assert_ne!(a, b);
    }
}
