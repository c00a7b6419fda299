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

use clap::Parser;
use tracing::info;

use dnsattr::*;

fn main() -> anyhow::Result<()> {
    let args = config::Args::parse();
    telemetry::setup_logging();
    if args.list_interfaces {
        return list_interfaces();
    }
    let config = config::parse_config(args)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async move { run(config).await })
}

fn list_interfaces() -> anyhow::Result<()> {
    for device in capture::list_interfaces()? {
        match device.desc {
            Some(desc) => println!("{}\t{}", device.name, desc),
            None => println!("{}", device.name),
        }
    }
    Ok(())
}

async fn run(config: config::Config) -> anyhow::Result<()> {
    info!("version: {}", version::BuildInfo::new());
    info!(
        "running with config: {}",
        serde_yaml::to_string(&config)?.trim_end()
    );
    let bound = match app::build(config).await {
        Err(e)
            if e
                .downcast_ref::<capture::Error>()
                .is_some_and(capture::Error::is_interface_error) =>
        {
            println!("invalid interface (check arguments)");
            return Ok(());
        }
        res => res?,
    };
    bound.wait_termination().await?;
    Ok(())
}
