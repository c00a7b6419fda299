// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::env;
use std::fmt;
use std::fmt::{Display, Formatter};
use std::string::String;

const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");
const BUILD_GIT_REVISION: Option<&str> = option_env!("DNSATTR_BUILD_GIT_REVISION");
const BUILD_STATUS: Option<&str> = option_env!("DNSATTR_BUILD_STATUS");
const BUILD_TAG: Option<&str> = option_env!("DNSATTR_BUILD_TAG");

#[derive(Clone, Debug, Default)]
pub struct BuildInfo {
    pub version: String,
    pub git_revision: String,
    pub build_status: String,
    pub git_tag: String,
    pub target: String,
}

impl BuildInfo {
    pub fn new() -> Self {
        BuildInfo {
            version: BUILD_VERSION.to_string(),
            git_revision: BUILD_GIT_REVISION.unwrap_or("unknown").to_string(),
            build_status: BUILD_STATUS.unwrap_or("unknown").to_string(),
            git_tag: BUILD_TAG.unwrap_or(BUILD_VERSION).to_string(),
            target: format!("{}/{}", env::consts::OS, env::consts::ARCH),
        }
    }
}

impl Display for BuildInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "version.BuildInfo{{Version:\"{}\", GitRevision:\"{}\", BuildStatus:\"{}\", GitTag:\"{}\", Target:\"{}\"}}",
            self.version, self.git_revision, self.build_status, self.git_tag, self.target
        )
    }
}
