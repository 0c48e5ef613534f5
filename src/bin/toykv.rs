/*
 * toykv is a single replica of a replicated key/value store. It takes the
 * simulator relay's UDP port, its own replica ID, and the IDs of its peers
 * as positional arguments, then runs a consensus replica until killed.
 */

#![warn(clippy::all)]

use rand::rngs::StdRng;
use rand::SeedableRng as _;
use toykv::error::Result;
use toykv::raft;

fn main() -> Result<()> {
    let args = clap::command!()
        .about("A replicated key/value store replica")
        .arg(
            clap::Arg::new("port")
                .required(true)
                .value_parser(clap::value_parser!(u16))
                .help("UDP port of the simulator relay"),
        )
        .arg(clap::Arg::new("id").required(true).help("The ID of this replica"))
        .arg(
            clap::Arg::new("peers")
                .required(true)
                .num_args(1..)
                .help("The IDs of the other replicas"),
        )
        .arg(
            clap::Arg::new("log-level")
                .long("log-level")
                .default_value("info")
                .help("Log level (error, warn, info, debug, trace)"),
        )
        .get_matches();

    let loglevel = args.get_one::<String>("log-level").unwrap().parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("toykv");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    let port = *args.get_one::<u16>("port").unwrap();
    let id = args.get_one::<String>("id").unwrap().clone();
    let peers = args.get_many::<String>("peers").unwrap().cloned().collect();

    raft::Server::new(id, peers, port, raft::Options::default(), StdRng::from_entropy())?.serve()
}
