use taskweave_core::RoleConfig;

/// Role used for code generation.
pub const ROLE_CODE: &str = "code";
/// Role used for writing and running tests.
pub const ROLE_TEST: &str = "test";
/// Role used for reviews.
pub const ROLE_REVIEW: &str = "review";
/// Role used for research tasks.
pub const ROLE_RESEARCH: &str = "research";
/// Role used for analysis tasks.
pub const ROLE_ANALYSIS: &str = "analysis";

/// Default role table, all served by one provider and base model.
///
/// The code role is kept alive since almost every plan starts with it; the
/// others unload after a short idle period.
pub fn default_roles(provider: &str, base_model: &str) -> Vec<RoleConfig> {
    vec![
        code_role(provider, base_model),
        test_role(provider, base_model),
        review_role(provider, base_model),
        research_role(provider, base_model),
        analysis_role(provider, base_model),
    ]
}

fn code_role(provider: &str, model: &str) -> RoleConfig {
    let mut role = RoleConfig::new(ROLE_CODE, provider, model).with_keep_alive(true);
    role.temperature = 0.2;
    role
}

fn test_role(provider: &str, model: &str) -> RoleConfig {
    let mut role = RoleConfig::new(ROLE_TEST, provider, model).with_idle_unload(300);
    role.temperature = 0.2;
    role
}

fn review_role(provider: &str, model: &str) -> RoleConfig {
    let mut role = RoleConfig::new(ROLE_REVIEW, provider, model).with_idle_unload(300);
    role.temperature = 0.1;
    role
}

fn research_role(provider: &str, model: &str) -> RoleConfig {
    let mut role = RoleConfig::new(ROLE_RESEARCH, provider, model).with_idle_unload(120);
    role.temperature = 0.5;
    role
}

fn analysis_role(provider: &str, model: &str) -> RoleConfig {
    let mut role = RoleConfig::new(ROLE_ANALYSIS, provider, model).with_idle_unload(120);
    role.temperature = 0.3;
    role
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_roles_cover_every_worker_kind() {
        let roles = default_roles("ollama", "llama3.1:8b");
        let names: Vec<_> = roles.iter().map(|r| r.role.as_str()).collect();
        assert_eq!(names, vec![ROLE_CODE, ROLE_TEST, ROLE_REVIEW, ROLE_RESEARCH, ROLE_ANALYSIS]);
        assert!(roles.iter().all(|r| r.provider == "ollama"));
    }

    #[test]
    fn test_code_role_stays_loaded() {
        let roles = default_roles("p", "m");
        assert!(roles[0].keep_alive);
        assert!(roles[1..].iter().all(|r| !r.keep_alive && r.idle_unload_secs > 0));
    }
}
