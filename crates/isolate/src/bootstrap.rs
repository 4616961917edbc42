use deno_core::{Extension, op2};

#[op2]
async fn op_sleep(ms: u32) {
    tokio::time::sleep(std::time::Duration::from_millis(ms as u64)).await;
}

deno_core::extension!(call_runtime, ops = [op_sleep]);

pub(crate) fn runtime_extensions() -> Vec<Extension> {
    vec![call_runtime::init()]
}

/// Installed once per isolate, before any submitted code runs. Defines the
/// invocation context pieces (`deep` client, `gql`, the capability registry
/// behind `require`), the failure serializer, and the two invocation drivers.
pub(crate) const BOOTSTRAP: &str = r#"
    if (typeof globalThis.console === 'undefined') {
        globalThis.console = {
            log(...args) { Deno.core.print(args.join(' ') + '\n'); },
            error(...args) { Deno.core.print('[ERROR] ' + args.join(' ') + '\n'); },
            warn(...args) { Deno.core.print('[WARN] ' + args.join(' ') + '\n'); },
            info(...args) { Deno.core.print('[INFO] ' + args.join(' ') + '\n'); },
            debug(...args) { Deno.core.print('[DEBUG] ' + args.join(' ') + '\n'); },
        };
    }

    globalThis.sleep = (ms) => Deno.core.ops.op_sleep(Math.max(0, Math.floor(Number(ms) || 0)));

    // Timer callbacks run detached from any invocation promise, so a throw
    // in one must be contained here or it becomes an unobserved rejection.
    let nextTimerId = 1;
    globalThis.setTimeout = (callback, ms, ...args) => {
        const id = nextTimerId++;
        globalThis.sleep(ms).then(() => {
            try {
                callback(...args);
            } catch (failure) {
                const message = failure && failure.message !== undefined
                    ? failure.message
                    : String(failure);
                console.error('Uncaught (in timer):', message);
            }
        });
        return id;
    };

    globalThis.gql = (strings, ...values) => {
        if (typeof strings === 'string') return strings;
        let query = '';
        for (let i = 0; i < strings.length; i++) {
            query += strings[i];
            if (i < values.length) query += String(values[i]);
        }
        return query;
    };

    // Capability registry behind the context's `require`. Closed by default;
    // deployments extend it through __registerCapability instead of getting
    // open host module resolution.
    const capabilityRegistry = Object.create(null);
    globalThis.__registerCapability = (id, capability) => {
        capabilityRegistry[id] = capability;
    };
    globalThis.__require = (id) => {
        const capability = capabilityRegistry[id];
        if (capability === undefined) {
            throw new Error(`Module "${id}" is not available to submitted code`);
        }
        return capability;
    };
    globalThis.__registerCapability('gql', { gql: globalThis.gql });
    globalThis.__registerCapability('timers', {
        sleep: globalThis.sleep,
        setTimeout: globalThis.setTimeout,
    });

    globalThis.__makeDeepClient = (seed) => {
        const client = {
            linkId: seed.linkId ?? null,
            token: seed.token,
            path: seed.client.path,
            ssl: seed.client.ssl,
            unsafe: {},
        };
        if (seed.admin) {
            client.unsafe.hasura = {
                path: seed.admin.path,
                ssl: seed.admin.ssl,
                secret: seed.admin.secret,
            };
        }
        return client;
    };

    globalThis.__makeContext = (seed, data) => ({
        data,
        deep: globalThis.__makeDeepClient(seed),
        gql: globalThis.gql,
        require: globalThis.__require,
    });

    // Serializes an arbitrary thrown value. Includes non-enumerable own
    // properties (message, stack) via Object.getOwnPropertyNames; cyclic or
    // otherwise unserializable values fall back to a minimal message shape.
    globalThis.__serializeFailure = (failure) => {
        try {
            if (failure === null || typeof failure === 'undefined') return null;
            if (typeof failure !== 'object' && typeof failure !== 'function') {
                return JSON.parse(JSON.stringify(failure));
            }
            return JSON.parse(JSON.stringify(failure, Object.getOwnPropertyNames(failure), 2));
        } catch (_) {
            try {
                const message = failure && failure.message !== undefined ? failure.message : failure;
                return { message: String(message) };
            } catch (_) {
                return { message: 'unserializable failure' };
            }
        }
    };

    globalThis.__makeHttpExchange = (request) => {
        const state = {
            status: 200,
            headers: {},
            body: '',
            body_base64: null,
            finished: false,
            next: false,
        };
        const res = {
            status(code) { state.status = Number(code) || 200; return res; },
            set(name, value) { state.headers[String(name).toLowerCase()] = String(value); return res; },
            setHeader(name, value) { return res.set(name, value); },
            json(value) {
                if (!state.headers['content-type']) state.headers['content-type'] = 'application/json';
                state.body = JSON.stringify(value);
                state.finished = true;
                return res;
            },
            send(value) {
                if (typeof value === 'string') { state.body = value; state.finished = true; return res; }
                return res.json(value);
            },
            end(value) {
                if (typeof value === 'string') state.body = value;
                state.finished = true;
                return res;
            },
        };
        const next = () => { state.next = true; };
        return { req: request, res, next, state };
    };

    globalThis.__invokeCallable = async () => {
        try {
            const context = globalThis.__makeContext(globalThis.__contextSeed, globalThis.__callData);
            const value = await globalThis.__callable(context);
            return { resolved: value === undefined ? null : value };
        } catch (failure) {
            return { rejected: globalThis.__serializeFailure(failure) };
        }
    };

    globalThis.__invokePassthrough = async () => {
        const exchange = globalThis.__makeHttpExchange(globalThis.__httpRequest);
        try {
            const context = globalThis.__makeContext(globalThis.__contextSeed, globalThis.__callData);
            await globalThis.__callable(exchange.req, exchange.res, exchange.next, context);
            return { resolved: exchange.state };
        } catch (failure) {
            return { rejected: globalThis.__serializeFailure(failure), state: exchange.state };
        }
    };
"#;
