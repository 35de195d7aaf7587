//! Static framework descriptor table.
//!
//! Everything that varies per framework (entry file location, starter
//! template, whether a managed environment is needed) is looked up here, so
//! callers never branch on individual frameworks.

use crate::types::Language;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Framework tag chosen for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    SwiftUi,
    Python,
    FastApi,
    Flask,
    Express,
    React,
    Rust,
    Go,
    Html,
    Custom,
}

/// Per-framework behavior.
#[derive(Debug, Clone, Copy)]
pub struct FrameworkDescriptor {
    pub framework: Framework,
    pub tag: &'static str,
    pub display_name: &'static str,
    pub language: Language,
    /// Entry file location relative to the project root
    pub entry_path: &'static str,
    pub template: &'static str,
    pub requires_environment: bool,
    /// Dependency manifest written next to the sources, if any
    pub manifest_file: Option<&'static str>,
    pub default_manifest: &'static str,
}

const SWIFTUI_TEMPLATE: &str = r#"import SwiftUI

@main
struct NodeApp: App {
    var body: some Scene {
        WindowGroup {
            Text("Hello, world!")
                .padding()
        }
    }
}
"#;

const PYTHON_TEMPLATE: &str = r#"def main():
    print("Hello, world!")


if __name__ == "__main__":
    main()
"#;

const FASTAPI_TEMPLATE: &str = r#"from fastapi import FastAPI

app = FastAPI()


@app.get("/")
def read_root():
    return {"message": "Hello, world!"}
"#;

const FLASK_TEMPLATE: &str = r#"from flask import Flask

app = Flask(__name__)


@app.route("/")
def index():
    return "Hello, world!"


if __name__ == "__main__":
    app.run(debug=True)
"#;

const EXPRESS_TEMPLATE: &str = r#"const express = require("express");

const app = express();
const port = process.env.PORT || 3000;

app.get("/", (req, res) => {
  res.send("Hello, world!");
});

app.listen(port, () => {
  console.log(`Listening on port ${port}`);
});
"#;

const REACT_TEMPLATE: &str = r#"export default function App() {
  return <h1>Hello, world!</h1>;
}
"#;

const RUST_TEMPLATE: &str = r#"fn main() {
    println!("Hello, world!");
}
"#;

const GO_TEMPLATE: &str = r#"package main

import "fmt"

func main() {
	fmt.Println("Hello, world!")
}
"#;

const HTML_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
  <head>
    <meta charset="utf-8">
    <title>Hello</title>
  </head>
  <body>
    <h1>Hello, world!</h1>
  </body>
</html>
"#;

const CUSTOM_TEMPLATE: &str = "# New node\n";

/// The descriptor table, one row per [`Framework`] variant.
pub static FRAMEWORKS: &[FrameworkDescriptor] = &[
    FrameworkDescriptor {
        framework: Framework::SwiftUi,
        tag: "swiftui",
        display_name: "SwiftUI",
        language: Language::Swift,
        entry_path: "Sources/main.swift",
        template: SWIFTUI_TEMPLATE,
        requires_environment: false,
        manifest_file: None,
        default_manifest: "",
    },
    FrameworkDescriptor {
        framework: Framework::Python,
        tag: "python",
        display_name: "Python",
        language: Language::Python,
        entry_path: "main.py",
        template: PYTHON_TEMPLATE,
        requires_environment: true,
        manifest_file: Some("requirements.txt"),
        default_manifest: "",
    },
    FrameworkDescriptor {
        framework: Framework::FastApi,
        tag: "fastapi",
        display_name: "FastAPI",
        language: Language::Python,
        entry_path: "main.py",
        template: FASTAPI_TEMPLATE,
        requires_environment: true,
        manifest_file: Some("requirements.txt"),
        default_manifest: "fastapi\nuvicorn\n",
    },
    FrameworkDescriptor {
        framework: Framework::Flask,
        tag: "flask",
        display_name: "Flask",
        language: Language::Python,
        entry_path: "app.py",
        template: FLASK_TEMPLATE,
        requires_environment: true,
        manifest_file: Some("requirements.txt"),
        default_manifest: "flask\n",
    },
    FrameworkDescriptor {
        framework: Framework::Express,
        tag: "express",
        display_name: "Express",
        language: Language::JavaScript,
        entry_path: "index.js",
        template: EXPRESS_TEMPLATE,
        requires_environment: false,
        manifest_file: None,
        default_manifest: "",
    },
    FrameworkDescriptor {
        framework: Framework::React,
        tag: "react",
        display_name: "React",
        language: Language::JavaScript,
        entry_path: "src/App.jsx",
        template: REACT_TEMPLATE,
        requires_environment: false,
        manifest_file: None,
        default_manifest: "",
    },
    FrameworkDescriptor {
        framework: Framework::Rust,
        tag: "rust",
        display_name: "Rust",
        language: Language::Rust,
        entry_path: "src/main.rs",
        template: RUST_TEMPLATE,
        requires_environment: false,
        manifest_file: None,
        default_manifest: "",
    },
    FrameworkDescriptor {
        framework: Framework::Go,
        tag: "go",
        display_name: "Go",
        language: Language::Go,
        entry_path: "main.go",
        template: GO_TEMPLATE,
        requires_environment: false,
        manifest_file: None,
        default_manifest: "",
    },
    FrameworkDescriptor {
        framework: Framework::Html,
        tag: "html",
        display_name: "HTML",
        language: Language::Html,
        entry_path: "index.html",
        template: HTML_TEMPLATE,
        requires_environment: false,
        manifest_file: None,
        default_manifest: "",
    },
    FrameworkDescriptor {
        framework: Framework::Custom,
        tag: "custom",
        display_name: "Custom",
        language: Language::Markdown,
        entry_path: "README.md",
        template: CUSTOM_TEMPLATE,
        requires_environment: false,
        manifest_file: None,
        default_manifest: "",
    },
];

impl Framework {
    /// Look up this framework's descriptor.
    pub fn descriptor(self) -> &'static FrameworkDescriptor {
        FRAMEWORKS
            .iter()
            .find(|d| d.framework == self)
            .unwrap_or(&FRAMEWORKS[FRAMEWORKS.len() - 1])
    }

    pub fn tag(self) -> &'static str {
        self.descriptor().tag
    }

    pub fn entry_path(self) -> &'static str {
        self.descriptor().entry_path
    }

    pub fn requires_environment(self) -> bool {
        self.descriptor().requires_environment
    }

    /// All frameworks in table order.
    pub fn all() -> impl Iterator<Item = Framework> {
        FRAMEWORKS.iter().map(|d| d.framework)
    }
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

impl std::str::FromStr for Framework {
    type Err = crate::error::TrellisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        FRAMEWORKS
            .iter()
            .find(|d| d.tag == wanted || d.display_name.to_lowercase() == wanted)
            .map(|d| d.framework)
            .ok_or_else(|| {
                crate::error::TrellisError::invalid_input(format!(
                    "Unknown framework '{}'. Must be one of: {}",
                    s,
                    FRAMEWORKS.iter().map(|d| d.tag).collect::<Vec<_>>().join(", ")
                ))
            })
    }
}
