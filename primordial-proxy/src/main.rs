//! The deployed proxy binary.
//!
//! Reads its configuration document — session token, routes, real keys —
//! from standard input until EOF, binds every listener, emits the
//! readiness marker on standard error, and serves until killed. The
//! orchestrator's signal (via VM teardown) terminates the process, which
//! closes all listeners and aborts in-flight forwards; exit is nonzero on
//! any failure path.
//!
//! Secrets arrive on stdin only. They are never written to argv,
//! environment, or disk, and never echoed to stderr.

use primordial_proxy::ProxyConfig;
use std::io::Read;

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let mut raw = Vec::new();
    if std::io::stdin().read_to_end(&mut raw).is_err() {
        eprintln!("primordial-proxy: failed to read configuration");
        return 2;
    }

    let config = match ProxyConfig::from_json(&raw) {
        Ok(config) => config,
        Err(e) => {
            // The error never contains secret material; config parse
            // failures report structure, not content.
            eprintln!("primordial-proxy: {e}");
            return 2;
        }
    };

    let server = match primordial_proxy::serve(config) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("primordial-proxy: {e}");
            return 1;
        }
    };

    eprintln!("{}", server.ready_line());
    server.join();
    1
}
