use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hookhost::binding::{FunctionBinder, FunctionBinding, ParamType};
use hookhost::config::HostConfig;
use hookhost::{HostValue, PluginHost};
use std::rc::Rc;
use tempfile::tempdir;

/// Benchmark argument marshaling through a bound host function
fn bench_function_binding(c: &mut Criterion) {
    let mut group = c.benchmark_group("function_binding");
    let lua = mlua::Lua::new();
    let add = Rc::new(
        FunctionBinding::new("Add", |_, args| Ok(HostValue::Int(args.int(0)? + args.int(1)?)))
            .param("a", ParamType::Int)
            .param("b", ParamType::Int),
    );
    lua.globals()
        .set("Add", FunctionBinder::bind(&lua, add).unwrap())
        .unwrap();

    for (label, code) in [("exact", "return Add(1, 2)"), ("parsed", r#"return Add("1", "2")"#)] {
        let chunk = lua.load(code).into_function().unwrap();
        group.bench_function(label, |b| b.iter(|| black_box(chunk.call::<_, i64>(()).unwrap())));
    }

    group.finish();
}

/// Benchmark hook fan-out across several subscribed plugins
fn bench_hook_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("hook_dispatch");

    for plugins in &[1usize, 8, 32] {
        let dir = tempdir().unwrap();
        let mut config = HostConfig::default();
        config.plugins.directory = dir.path().join("plugins");
        config.plugins.config_directory = dir.path().join("config");
        config.plugins.watch = false;
        std::fs::create_dir_all(&config.plugins.directory).unwrap();

        for i in 0..*plugins {
            let name = format!("P{i}");
            let source = format!(
                "{name} = {{ Title = \"{name}\", Author = \"bench\", Version = {{1, 0, 0}} }}\n\
                 function {name}:OnTick(n, data) return nil end\n"
            );
            std::fs::write(config.plugins.directory.join(format!("{name}.lua")), source).unwrap();
        }

        let mut host = PluginHost::new(&config).unwrap();
        host.start().unwrap();
        let args = [
            HostValue::Int(7),
            HostValue::List(vec![HostValue::from("a"), HostValue::Float(1.5)]),
        ];

        group.bench_with_input(BenchmarkId::from_parameter(plugins), plugins, |b, _| {
            b.iter(|| black_box(host.call_hook("OnTick", black_box(&args))));
        });
        host.shutdown();
    }

    group.finish();
}

criterion_group!(benches, bench_function_binding, bench_hook_dispatch);
criterion_main!(benches);
