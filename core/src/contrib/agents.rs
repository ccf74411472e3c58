//! Agent and skills contributions: per-agent packages and prompt
//! instructions, plus the template's own prompt fragments.

use super::Contributor;
use super::Package;
use super::PackageContributor;
use super::PromptContributor;
use super::PromptFragment;
use crate::error::Result;
use crate::template::AgentSpec;

pub struct AgentsContributor {
    agents: Vec<AgentSpec>,
}

impl AgentsContributor {
    pub fn new(agents: Vec<AgentSpec>) -> Self {
        Self { agents }
    }
}

impl PackageContributor for AgentsContributor {
    /// Agent names double as package names; templates name agents after the
    /// package that provides them.
    fn packages(&self) -> Result<Vec<Package>> {
        Ok(self
            .agents
            .iter()
            .map(|agent| Package::from(agent.name.clone()))
            .collect())
    }
}

impl PromptContributor for AgentsContributor {
    fn prompt_fragments(&self) -> Result<Vec<PromptFragment>> {
        Ok(self
            .agents
            .iter()
            .filter_map(|agent| {
                agent
                    .prompt_instructions
                    .as_ref()
                    .map(|instructions| PromptFragment {
                        section: "agents".to_string(),
                        priority: 100,
                        content: instructions.clone(),
                    })
            })
            .collect())
    }
}

impl Contributor for AgentsContributor {
    fn as_package_contributor(&self) -> Option<&dyn PackageContributor> {
        Some(self)
    }
    fn as_prompt_contributor(&self) -> Option<&dyn PromptContributor> {
        Some(self)
    }
}

/// The template's declared prompt fragments, passed through verbatim.
pub struct SkillsContributor {
    fragments: Vec<PromptFragment>,
}

impl SkillsContributor {
    pub fn new(fragments: Vec<PromptFragment>) -> Self {
        Self { fragments }
    }
}

impl PromptContributor for SkillsContributor {
    fn prompt_fragments(&self) -> Result<Vec<PromptFragment>> {
        Ok(self.fragments.clone())
    }
}

impl Contributor for SkillsContributor {
    fn as_prompt_contributor(&self) -> Option<&dyn PromptContributor> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn agents_contribute_packages_and_instructions() {
        let contributor = AgentsContributor::new(vec![
            AgentSpec {
                name: "claude".to_string(),
                secret_name: None,
                prompt_instructions: Some("Prefer small commits.".to_string()),
            },
            AgentSpec {
                name: "aider".to_string(),
                secret_name: None,
                prompt_instructions: None,
            },
        ]);
        let packages = contributor.packages().expect("packages");
        assert_eq!(
            packages.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            vec!["claude", "aider"]
        );
        let fragments = contributor.prompt_fragments().expect("fragments");
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].section, "agents");
        assert_eq!(fragments[0].content, "Prefer small commits.");
    }
}
