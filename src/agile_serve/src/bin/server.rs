use agile_serve::{
    backend::SimulatedModel,
    grpc::{self, infer_server::InferServer},
    parse_duration, parse_list,
};
use clap::{App, Arg, ArgMatches};
use crossbeam::channel;
use orchestrator::{
    Builder, Device, DynamicBatching, HealthEvent, InstanceGroup, ModelConfig, ModelInfo,
    Scheduling, SequenceBatching, TimeoutPolicy,
};
use std::{error::Error, net::SocketAddr, sync::Arc, thread, time::Duration};
use tonic::transport::Server;

type BoxError = Box<dyn Error + Send + Sync>;

fn duration(matches: &ArgMatches, name: &str) -> Result<Duration, BoxError> {
    let value = matches.value_of(name).unwrap_or_default();
    parse_duration(value).ok_or_else(|| {
        format!(
            "can't parse {} = {} to duration, use value[s|ms|us|ns]",
            name, value
        )
        .into()
    })
}

fn number<T>(matches: &ArgMatches, name: &str) -> Result<T, BoxError>
where
    T: std::str::FromStr,
    T::Err: Error + Send + Sync + 'static,
{
    Ok(matches.value_of(name).unwrap_or_default().parse()?)
}

fn model_config(matches: &ArgMatches) -> Result<ModelConfig, BoxError> {
    let instances: usize = number(matches, "instances")?;
    let gpus: Vec<i32> = parse_list(matches.value_of("gpus").unwrap_or_default())?;
    let instance_groups = if gpus.is_empty() {
        vec![InstanceGroup::new(instances, Device::Cpu)]
    } else {
        gpus.into_iter()
            .map(|gpu| InstanceGroup::new(instances, Device::Gpu(gpu)))
            .collect()
    };
    let min_batch_size: Option<usize> = match matches.value_of("min_batch_size") {
        Some(value) => Some(value.parse()?),
        None => None,
    };
    let batching = DynamicBatching::new()
        .preferred_batch_sizes(parse_list(
            matches.value_of("preferred_batch_sizes").unwrap_or_default(),
        )?)
        .max_queue_delay(duration(matches, "max_queue_delay")?)
        .min_batch_size(min_batch_size);
    let scheduling = if matches.is_present("sequence") {
        let policy = if matches.is_present("restart_sequences") {
            TimeoutPolicy::Restart
        } else {
            TimeoutPolicy::Fail
        };
        Scheduling::Sequence(
            SequenceBatching::new()
                .idle_timeout(duration(matches, "sequence_timeout")?)
                .timeout_policy(policy)
                .batching(batching),
        )
    } else if matches.is_present("direct") {
        Scheduling::Direct
    } else {
        Scheduling::Dynamic(batching)
    };
    let max_queue_size: Option<usize> = match matches.value_of("max_queue_size") {
        Some(value) => Some(value.parse()?),
        None => None,
    };
    Ok(ModelConfig::new(matches.value_of("model").unwrap_or("echo"))
        .version(number(matches, "version")?)
        .max_batch_size(number(matches, "max_batch_size")?)
        .instance_groups(instance_groups)
        .scheduling(scheduling)
        .max_queue_size(max_queue_size))
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let matches = App::new("Agile Serve Server")
        .about("Serves a simulated model through the dynamic batching scheduler")
        .arg(
            Arg::with_name("address")
                .short("a")
                .help("Address to listen on")
                .default_value("127.0.0.1:8080")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("model")
                .short("n")
                .help("Model name")
                .default_value("echo")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("version")
                .short("v")
                .help("Model version")
                .default_value("1")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("instances")
                .short("i")
                .help("Instances per device")
                .default_value("2")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("gpus")
                .short("g")
                .help("Comma separated GPU ids, empty to run on CPU")
                .default_value("")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("max_batch_size")
                .short("b")
                .help("Maximum rows per batch")
                .default_value("8")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("preferred_batch_sizes")
                .short("p")
                .help("Comma separated preferred batch sizes, e.g. 4,8")
                .default_value("")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("max_queue_delay")
                .short("t")
                .help("Longest a request waits to be batched, use value[s|ms|us|ns], e.g. 1ms")
                .default_value("1ms")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("min_batch_size")
                .short("M")
                .help("Cut early for an idle instance once this many rows wait")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("max_queue_size")
                .short("q")
                .help("Reject requests once this many wait")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("direct")
                .short("D")
                .help("One request per batch")
                .conflicts_with("sequence"),
        )
        .arg(
            Arg::with_name("sequence")
                .short("S")
                .help("Serve a stateful model with sequence batching"),
        )
        .arg(
            Arg::with_name("sequence_timeout")
                .short("T")
                .help("Idle timeout of a sequence")
                .default_value("1s")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("restart_sequences")
                .short("R")
                .help("Restart timed out sequences instead of failing them"),
        )
        .arg(
            Arg::with_name("latency")
                .short("l")
                .help("Simulated fixed execution time per batch")
                .default_value("2ms")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("row_latency")
                .short("r")
                .help("Simulated execution time per row")
                .default_value("100us")
                .takes_value(true),
        )
        .get_matches();

    let mut builder = env_logger::Builder::from_default_env();
    builder.format_timestamp_micros().init();

    let config = model_config(&matches)?;
    let latency = duration(&matches, "latency")?;
    let row_latency = duration(&matches, "row_latency")?;
    let factory = SimulatedModel::factory(latency, row_latency);
    // models loaded over gRPC share the command line settings
    let template = config.clone();
    let loader: grpc::Loader = Arc::new(move |name: &str, version: u64| {
        let mut config = template.clone().version(version);
        config.name = name.to_string();
        Ok((config, SimulatedModel::factory(latency, row_latency)))
    });
    let (health_tx, health_rx) = channel::unbounded::<HealthEvent>();
    thread::spawn(move || {
        for event in health_rx.iter() {
            log::warn!("health: {:?}", event);
        }
    });
    let orchestrator = Builder::new()
        .health_listener(Some(health_tx))
        .register_model(ModelInfo::new(config, factory))
        .build()?;
    let grpc_service = grpc::Service::new(Arc::new(orchestrator)).with_loader(loader);
    let address: SocketAddr = matches.value_of("address").unwrap_or("127.0.0.1:8080").parse()?;
    println!("service is ready on {}", address);
    Server::builder()
        .add_service(InferServer::new(grpc_service))
        .serve(address)
        .await?;
    Ok(())
}
