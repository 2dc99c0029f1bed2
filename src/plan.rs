//! Build plan resolution
//!
//! A [`BuildPlan`] says which base image to build on, which commands install,
//! build and start the workload, and which port it listens on. The pipeline
//! asks a [`BuildPlanResolver`] for a plan and then applies any per-field
//! overrides stored on the service.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use crate::error::DeployError;

/// Shape of the image the recipe produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanKind {
    /// The source ships its own Dockerfile
    Dockerfile,
    /// Files served by nginx, optionally built first
    Static,
    /// Server-rendered node framework
    Ssr,
    /// Long-running application server
    Server,
}

/// Resolved commands and runtime for a source tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildPlan {
    pub framework: String,
    pub kind: PlanKind,
    pub runtime_image: String,
    pub install_cmd: Option<String>,
    pub build_cmd: Option<String>,
    pub start_cmd: Option<String>,
    pub output_dir: Option<String>,
    pub internal_port: u16,
}

/// User-supplied replacements for individual plan fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_port: Option<u16>,
}

impl BuildOverrides {
    pub fn is_empty(&self) -> bool {
        *self == BuildOverrides::default()
    }
}

impl BuildPlan {
    /// Replace each field the user overrode, leaving the rest as resolved
    pub fn with_overrides(mut self, overrides: &BuildOverrides) -> Self {
        fn non_empty(value: &Option<String>) -> Option<String> {
            value.as_ref().filter(|v| !v.trim().is_empty()).cloned()
        }

        if let Some(image) = non_empty(&overrides.runtime_image) {
            self.runtime_image = image;
        }
        if let Some(cmd) = non_empty(&overrides.install_cmd) {
            self.install_cmd = Some(cmd);
        }
        if let Some(cmd) = non_empty(&overrides.build_cmd) {
            self.build_cmd = Some(cmd);
        }
        if let Some(cmd) = non_empty(&overrides.start_cmd) {
            self.start_cmd = Some(cmd);
        }
        if let Some(dir) = non_empty(&overrides.output_dir) {
            self.output_dir = Some(dir);
        }
        if let Some(port) = overrides.internal_port.filter(|p| *p > 0) {
            self.internal_port = port;
        }
        self
    }
}

/// Pluggable source-tree inspection
pub trait BuildPlanResolver: Send + Sync {
    fn resolve(&self, workspace: &Path) -> Result<BuildPlan, DeployError>;
}

/// Resolves plans from marker files in the workspace root
pub struct MarkerResolver {
    node_image: String,
}

const STATIC_FRAMEWORKS: &[(&str, &str, &str)] = &[
    ("vite", "Vite", "dist"),
    ("react-scripts", "Create React App", "build"),
    ("@vue/cli-service", "Vue CLI", "dist"),
    ("@angular/core", "Angular", "dist"),
    ("gatsby", "Gatsby", "public"),
    ("astro", "Astro", "dist"),
];

const SSR_FRAMEWORKS: &[(&str, &str, &str)] = &[
    ("next", "Next.js", "npm start"),
    ("nuxt", "Nuxt", "node .output/server/index.mjs"),
    ("@sveltejs/kit", "SvelteKit", "node build"),
    ("@remix-run/node", "Remix", "npm start"),
    ("@remix-run/dev", "Remix", "npm start"),
];

const NGINX_IMAGE: &str = "nginx:alpine";
const PYTHON_IMAGE: &str = "python:3.12-slim";

impl MarkerResolver {
    pub fn new(node_version: &str) -> Self {
        Self {
            node_image: format!("node:{}-alpine", node_version),
        }
    }

    fn node_plan(&self, pkg: &Value) -> BuildPlan {
        let has_dep = |name: &str| {
            ["dependencies", "devDependencies"]
                .iter()
                .any(|section| pkg.get(section).and_then(|deps| deps.get(name)).is_some())
        };
        let has_script = |name: &str| pkg.get("scripts").and_then(|s| s.get(name)).is_some();

        let install = Some("npm install".to_string());

        for (dep, framework, start) in SSR_FRAMEWORKS {
            if has_dep(dep) {
                return BuildPlan {
                    framework: framework.to_string(),
                    kind: PlanKind::Ssr,
                    runtime_image: self.node_image.clone(),
                    install_cmd: install,
                    build_cmd: Some("npm run build".to_string()),
                    start_cmd: Some(start.to_string()),
                    output_dir: None,
                    internal_port: 3000,
                };
            }
        }

        if has_script("build") {
            for (dep, framework, output) in STATIC_FRAMEWORKS {
                if has_dep(dep) {
                    return BuildPlan {
                        framework: framework.to_string(),
                        kind: PlanKind::Static,
                        runtime_image: self.node_image.clone(),
                        install_cmd: install,
                        build_cmd: Some("npm run build".to_string()),
                        start_cmd: None,
                        output_dir: Some(output.to_string()),
                        internal_port: 80,
                    };
                }
            }
        }

        let framework = if has_dep("express") {
            "Express"
        } else if has_dep("fastify") {
            "Fastify"
        } else {
            "Node.js"
        };

        BuildPlan {
            framework: framework.to_string(),
            kind: PlanKind::Server,
            runtime_image: self.node_image.clone(),
            install_cmd: install,
            build_cmd: None,
            start_cmd: Some(if has_script("start") {
                "npm start".to_string()
            } else {
                "node index.js".to_string()
            }),
            output_dir: None,
            internal_port: 3000,
        }
    }

    fn python_plan(workspace: &Path) -> BuildPlan {
        let (framework, start, port) = if workspace.join("manage.py").exists() {
            ("Django", "python manage.py runserver 0.0.0.0:8000", 8000)
        } else if workspace.join("main.py").exists() && !workspace.join("app.py").exists() {
            ("Python", "python main.py", 5000)
        } else {
            ("Flask", "python app.py", 5000)
        };

        BuildPlan {
            framework: framework.to_string(),
            kind: PlanKind::Server,
            runtime_image: PYTHON_IMAGE.to_string(),
            install_cmd: Some("pip install --no-cache-dir -r requirements.txt".to_string()),
            build_cmd: None,
            start_cmd: Some(start.to_string()),
            output_dir: None,
            internal_port: port,
        }
    }
}

impl BuildPlanResolver for MarkerResolver {
    fn resolve(&self, workspace: &Path) -> Result<BuildPlan, DeployError> {
        if !workspace.is_dir() {
            return Err(DeployError::BuildPlan(format!(
                "workspace {} does not exist",
                workspace.display()
            )));
        }

        if workspace.join("Dockerfile").exists() {
            return Ok(BuildPlan {
                framework: "Dockerfile".to_string(),
                kind: PlanKind::Dockerfile,
                runtime_image: String::new(),
                install_cmd: None,
                build_cmd: None,
                start_cmd: None,
                output_dir: None,
                // Conventional default; overridable per service
                internal_port: 3000,
            });
        }

        let pkg_path = workspace.join("package.json");
        if pkg_path.exists() {
            let pkg = std::fs::read_to_string(&pkg_path)
                .ok()
                .and_then(|text| serde_json::from_str::<Value>(&text).ok())
                .unwrap_or(Value::Null);
            return Ok(self.node_plan(&pkg));
        }

        if workspace.join("requirements.txt").exists() {
            return Ok(Self::python_plan(workspace));
        }

        if workspace.join("index.html").exists() {
            return Ok(BuildPlan {
                framework: "Static HTML".to_string(),
                kind: PlanKind::Static,
                runtime_image: NGINX_IMAGE.to_string(),
                install_cmd: None,
                build_cmd: None,
                start_cmd: None,
                output_dir: Some(".".to_string()),
                internal_port: 80,
            });
        }

        Err(DeployError::BuildPlan(
            "no Dockerfile, package.json, requirements.txt or index.html found".to_string(),
        ))
    }
}
