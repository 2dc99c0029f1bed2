//! Build recipe synthesis
//!
//! Turns a resolved [`BuildPlan`] into Dockerfile text and writes it into the
//! workspace next to a `.dockerignore`. Sources that ship their own
//! Dockerfile are built as-is.

use std::path::Path;
use tracing::debug;

use crate::error::DeployError;
use crate::plan::{BuildPlan, PlanKind};

const DOCKERIGNORE: &str = "node_modules\n.git\n.env\n*.log\n";
const NGINX_IMAGE: &str = "nginx:alpine";

/// Lowercase a service name into `[a-z0-9-]` for container and image names
pub fn sanitize_label(name: &str) -> String {
    let label: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let label = label.trim_matches('-');
    if label.is_empty() {
        "service".to_string()
    } else {
        label.to_string()
    }
}

/// Image tag for one deployment of a service
pub fn image_tag(service_name: &str, deployment_id: &str) -> String {
    let short: String = deployment_id.chars().filter(|c| *c != '-').take(8).collect();
    format!("hostdeck/{}:{}", sanitize_label(service_name), short)
}

fn single_line(cmd: &str) -> String {
    cmd.replace(['\r', '\n'], " ").trim().to_string()
}

/// Render a command as an exec-form JSON array
fn exec_form(cmd: &str) -> String {
    let cmd = single_line(cmd);
    let argv = shell_words::split(&cmd)
        .ok()
        .filter(|argv| !argv.is_empty())
        .unwrap_or_else(|| vec!["sh".to_string(), "-c".to_string(), cmd.clone()]);
    serde_json::to_string(&argv).unwrap_or_else(|_| r#"["node","index.js"]"#.to_string())
}

fn nginx_config(port: u16) -> String {
    format!(
        "RUN echo 'server {{ listen {}; location / {{ root /usr/share/nginx/html; index index.html; \
         try_files $uri $uri/ /index.html; }} }}' > /etc/nginx/conf.d/default.conf\n",
        port
    )
}

/// Dockerfile text for a plan, or `None` when the source brings its own
pub fn synthesize(plan: &BuildPlan) -> Option<String> {
    let port = plan.internal_port;
    let mut out = String::from("# Generated by hostdeck\n");

    match plan.kind {
        PlanKind::Dockerfile => return None,
        PlanKind::Static => {
            let output_dir = plan.output_dir.as_deref().unwrap_or("dist");
            match &plan.build_cmd {
                Some(build) => {
                    out.push_str(&format!("FROM {} AS builder\nWORKDIR /app\nCOPY . .\n", plan.runtime_image));
                    if let Some(install) = &plan.install_cmd {
                        out.push_str(&format!("RUN {}\n", single_line(install)));
                    }
                    out.push_str(&format!("RUN {}\n\n", single_line(build)));
                    out.push_str(&format!("FROM {}\n", NGINX_IMAGE));
                    out.push_str(&format!(
                        "COPY --from=builder /app/{} /usr/share/nginx/html\n",
                        output_dir.trim_start_matches("./")
                    ));
                }
                None => {
                    out.push_str(&format!("FROM {}\n", NGINX_IMAGE));
                    out.push_str(&format!("COPY {} /usr/share/nginx/html\n", output_dir));
                }
            }
            out.push_str(&nginx_config(port));
            out.push_str(&format!("EXPOSE {}\n", port));
            out.push_str("CMD [\"nginx\", \"-g\", \"daemon off;\"]\n");
        }
        PlanKind::Ssr | PlanKind::Server => {
            out.push_str(&format!("FROM {}\nWORKDIR /app\nCOPY . .\n", plan.runtime_image));
            if let Some(install) = &plan.install_cmd {
                out.push_str(&format!("RUN {}\n", single_line(install)));
            }
            if let Some(build) = &plan.build_cmd {
                out.push_str(&format!("RUN {}\n", single_line(build)));
            }
            if plan.runtime_image.starts_with("python") {
                out.push_str("ENV PYTHONUNBUFFERED=1\n");
            }
            out.push_str(&format!("ENV PORT={}\nENV HOST=0.0.0.0\nEXPOSE {}\n", port, port));
            let start = plan.start_cmd.as_deref().unwrap_or("node index.js");
            out.push_str(&format!("CMD {}\n", exec_form(start)));
        }
    }

    Some(out)
}

/// Write the generated recipe into the build context. Returns whether a
/// recipe was generated.
pub async fn prepare_context(context_dir: &Path, plan: &BuildPlan) -> Result<bool, DeployError> {
    let Some(recipe) = synthesize(plan) else {
        if !context_dir.join("Dockerfile").exists() {
            return Err(DeployError::BuildPlan(
                "plan expects a Dockerfile but none exists in the source".to_string(),
            ));
        }
        debug!(dir = %context_dir.display(), "Using Dockerfile from source");
        return Ok(false);
    };

    tokio::fs::write(context_dir.join("Dockerfile"), recipe)
        .await
        .map_err(|e| DeployError::ImageBuild(format!("failed to write Dockerfile: {}", e)))?;
    tokio::fs::write(context_dir.join(".dockerignore"), DOCKERIGNORE)
        .await
        .map_err(|e| DeployError::ImageBuild(format!("failed to write .dockerignore: {}", e)))?;

    debug!(dir = %context_dir.display(), framework = %plan.framework, "Wrote generated Dockerfile");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(kind: PlanKind) -> BuildPlan {
        BuildPlan {
            framework: "Test".to_string(),
            kind,
            runtime_image: "node:20-alpine".to_string(),
            install_cmd: Some("npm install".to_string()),
            build_cmd: Some("npm run build".to_string()),
            start_cmd: Some("npm start".to_string()),
            output_dir: Some("dist".to_string()),
            internal_port: 3000,
        }
    }

    #[test]
    fn test_sanitize_label() {
        assert_eq!(sanitize_label("My_Blog"), "my-blog");
        assert_eq!(sanitize_label("--api--"), "api");
        assert_eq!(sanitize_label("___"), "service");
    }

    #[test]
    fn test_image_tag_per_deployment() {
        let tag = image_tag("Blog", "3f2a9c1e-0000-4000-8000-000000000000");
        assert_eq!(tag, "hostdeck/blog:3f2a9c1e");
    }

    #[test]
    fn test_static_multi_stage() {
        let mut p = plan(PlanKind::Static);
        p.internal_port = 80;
        let recipe = synthesize(&p).unwrap();

        assert!(recipe.contains("FROM node:20-alpine AS builder"));
        assert!(recipe.contains("RUN npm run build"));
        assert!(recipe.contains("FROM nginx:alpine"));
        assert!(recipe.contains("COPY --from=builder /app/dist /usr/share/nginx/html"));
        assert!(recipe.contains("try_files $uri $uri/ /index.html"));
        assert!(recipe.contains("EXPOSE 80"));
    }

    #[test]
    fn test_static_without_build_is_single_stage() {
        let mut p = plan(PlanKind::Static);
        p.build_cmd = None;
        p.output_dir = Some(".".to_string());
        p.internal_port = 80;
        let recipe = synthesize(&p).unwrap();

        assert!(!recipe.contains("AS builder"));
        assert!(recipe.contains("COPY . /usr/share/nginx/html"));
    }

    #[test]
    fn test_server_recipe() {
        let mut p = plan(PlanKind::Server);
        p.build_cmd = None;
        p.start_cmd = Some("node server.js --port \"3000\"".to_string());
        let recipe = synthesize(&p).unwrap();

        assert!(recipe.contains("RUN npm install"));
        assert!(!recipe.contains("npm run build"));
        assert!(recipe.contains("ENV PORT=3000"));
        assert!(recipe.contains("ENV HOST=0.0.0.0"));
        assert!(recipe.contains(r#"CMD ["node","server.js","--port","3000"]"#));
    }

    #[test]
    fn test_python_recipe() {
        let p = BuildPlan {
            framework: "Flask".to_string(),
            kind: PlanKind::Server,
            runtime_image: "python:3.12-slim".to_string(),
            install_cmd: Some("pip install --no-cache-dir -r requirements.txt".to_string()),
            build_cmd: None,
            start_cmd: Some("python app.py".to_string()),
            output_dir: None,
            internal_port: 5000,
        };
        let recipe = synthesize(&p).unwrap();
        assert!(recipe.contains("FROM python:3.12-slim"));
        assert!(recipe.contains("ENV PYTHONUNBUFFERED=1"));
        assert!(recipe.contains(r#"CMD ["python","app.py"]"#));
    }

    #[test]
    fn test_multiline_override_flattened() {
        let mut p = plan(PlanKind::Ssr);
        p.build_cmd = Some("npm run build\nRUN rm -rf /".to_string());
        let recipe = synthesize(&p).unwrap();
        assert!(recipe.contains("RUN npm run build RUN rm -rf /\n"));
    }

    #[test]
    fn test_unbalanced_quotes_fall_back_to_shell() {
        assert_eq!(exec_form("echo \"oops"), r#"["sh","-c","echo \"oops"]"#);
    }

    #[tokio::test]
    async fn test_prepare_context_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(prepare_context(dir.path(), &plan(PlanKind::Server)).await.unwrap());
        assert!(dir.path().join("Dockerfile").exists());
        let ignore = std::fs::read_to_string(dir.path().join(".dockerignore")).unwrap();
        assert!(ignore.contains("node_modules"));
    }

    #[tokio::test]
    async fn test_prepare_context_keeps_source_dockerfile() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM busybox\n").unwrap();

        assert!(!prepare_context(dir.path(), &plan(PlanKind::Dockerfile)).await.unwrap());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("Dockerfile")).unwrap(),
            "FROM busybox\n"
        );
        assert!(!dir.path().join(".dockerignore").exists());
    }
}
