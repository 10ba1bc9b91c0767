use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shelf_adapters::{PriceBracket, Sweep, SweepTarget};
use shelf_core::Taxonomy;
use tokio::fs;
use tracing::warn;

/// The global catalog's sweeps, in execution order by section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogPlan {
    #[serde(default)]
    pub price_brackets: Vec<PriceBracketPlan>,
    #[serde(default)]
    pub keywords: Vec<KeywordPlan>,
    #[serde(default)]
    pub sub_categories: Vec<SubCategoryPlan>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBracketPlan {
    pub keywords: String,
    pub category: String,
    pub brackets: Vec<PriceBracket>,
}

/// Keyword sweep; the category defaults to the keywords themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordPlan {
    pub keywords: String,
    #[serde(default)]
    pub category: Option<String>,
}

/// Sub-category sweep; the sub-category defaults to the keywords themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubCategoryPlan {
    pub keywords: String,
    pub category: String,
    #[serde(default)]
    pub sub_category: Option<String>,
}

impl KeywordPlan {
    fn category_name(&self) -> &str {
        self.category.as_deref().unwrap_or(&self.keywords)
    }
}

impl SubCategoryPlan {
    fn sub_category_name(&self) -> &str {
        self.sub_category.as_deref().unwrap_or(&self.keywords)
    }
}

impl Default for CatalogPlan {
    fn default() -> Self {
        let keyword = |keywords: &str, category: Option<&str>| KeywordPlan {
            keywords: keywords.to_string(),
            category: category.map(str::to_string),
        };
        let gaming = |keywords: &str| SubCategoryPlan {
            keywords: keywords.to_string(),
            category: "Gaming".to_string(),
            sub_category: None,
        };

        Self {
            price_brackets: vec![PriceBracketPlan {
                keywords: "jouets".to_string(),
                category: "Jouets".to_string(),
                brackets: vec![
                    PriceBracket { min: 1, max: 2000 },
                    PriceBracket { min: 2001, max: 5000 },
                    PriceBracket { min: 5001, max: 10000 },
                    PriceBracket { min: 10001, max: 100000 },
                ],
            }],
            keywords: vec![
                keyword("Jeux de société", None),
                keyword("Jeux éducatifs", None),
                keyword("Jeux plein air", None),
                keyword("Livre pour enfant", Some("Livres")),
                keyword("Gaming", None),
            ],
            sub_categories: vec![
                gaming("Consoles de jeux"),
                gaming("Jeux vidéo"),
                gaming("Accessoires Gaming"),
            ],
        }
    }
}

impl CatalogPlan {
    /// Reads a YAML plan, or the built-in plan when no path is configured.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn category_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .price_brackets
            .iter()
            .map(|p| p.category.clone())
            .chain(self.keywords.iter().map(|k| k.category_name().to_string()))
            .chain(self.sub_categories.iter().map(|s| s.category.clone()))
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn sub_category_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sub_categories
            .iter()
            .map(|s| s.sub_category_name().to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Builds the sweeps against resolved rows. A name with no row is logged
    /// and its sweep runs without that reference.
    pub fn sweeps(&self, taxonomy: &Taxonomy) -> Vec<Sweep> {
        let category = |name: &str| {
            let found = taxonomy.category(name).cloned();
            if found.is_none() {
                warn!(category = name, "category not found; products stored without it");
            }
            found.into_iter().collect::<Vec<_>>()
        };
        let sub_category = |name: &str| {
            let found = taxonomy.sub_category(name).cloned();
            if found.is_none() {
                warn!(sub_category = name, "sub-category not found; products stored without it");
            }
            found.into_iter().collect::<Vec<_>>()
        };

        let mut sweeps = Vec::new();
        for plan in &self.price_brackets {
            sweeps.push(Sweep::PriceBrackets {
                keywords: plan.keywords.clone(),
                brackets: plan.brackets.clone(),
                target: SweepTarget {
                    categories: category(&plan.category),
                    sub_categories: Vec::new(),
                },
            });
        }
        for plan in &self.keywords {
            sweeps.push(Sweep::Keyword {
                keywords: plan.keywords.clone(),
                target: SweepTarget {
                    categories: category(plan.category_name()),
                    sub_categories: Vec::new(),
                },
            });
        }
        for plan in &self.sub_categories {
            sweeps.push(Sweep::SubCategory {
                keywords: plan.keywords.clone(),
                target: SweepTarget {
                    categories: category(&plan.category),
                    sub_categories: sub_category(plan.sub_category_name()),
                },
            });
        }
        sweeps
    }
}
